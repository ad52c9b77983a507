use pingora::{server::Server, services::Service};

use spool::{config, logging, proxy::spool_proxy_service};

fn main() {
    // Read from the configuration file and the command line
    let conf = match config::render_config() {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
    };

    // Set up tracing with our custom logging configuration
    if let Err(e) = logging::init_logging(&conf.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    // Start the Server, which we will add services to.
    let mut my_server =
        Server::new_with_opt_and_conf(conf.pingora_opt(), conf.pingora_server_conf());

    tracing::info!("Applying Basic Proxies...");
    let mut services: Vec<Box<dyn Service>> = vec![];

    for beep in conf.basic_proxies {
        tracing::info!("Configuring Basic Proxy: {}", beep.name);
        let name = beep.name.clone();
        match spool_proxy_service(beep, &my_server) {
            Ok(service) => services.push(service),
            Err(e) => {
                tracing::error!("Failed to open the cache of proxy {}: {}", name, e);
                std::process::exit(1);
            }
        }
    }

    // Now we hand it over to pingora to run forever.
    tracing::info!("Bootstrapping...");
    my_server.bootstrap();
    tracing::info!("Bootstrapped. Adding Services...");
    my_server.add_services(services);
    tracing::info!("Starting Server...");
    my_server.run_forever();
}
