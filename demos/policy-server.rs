use std::{env, net::TcpListener, thread::spawn};

use log::*;
use wsframe::{policy::POLICY_PORT, AccessPolicy};

fn main() {
    env_logger::init();

    let domain = env::args().nth(1).unwrap_or_default();
    let port = env::args().nth(2).and_then(|p| p.parse().ok()).unwrap_or(80);
    let policy = AccessPolicy::new(domain, port);

    let server = TcpListener::bind(("0.0.0.0", POLICY_PORT)).unwrap();
    info!("Serving policy for {}:{} on port {}", policy.domain(), policy.port(), POLICY_PORT);

    for stream in server.incoming() {
        let policy = policy.clone();
        spawn(move || match stream {
            Ok(stream) => {
                if let Err(err) = policy.respond(stream) {
                    debug!("Policy client went away: {}", err);
                }
            }
            Err(e) => error!("Error accepting stream: {}", e),
        });
    }
}
