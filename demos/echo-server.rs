use std::{
    env,
    net::{TcpListener, TcpStream},
    thread::spawn,
    time::Duration,
};

use log::*;
use wsframe::{error::ProtocolError, serve, Error, Handler, Message, Result, UserContext};

struct Echo;

impl Handler for Echo {
    fn on_connect(&mut self, context: &mut UserContext) -> Result<()> {
        if let Some(request) = context.request() {
            info!("Connected on {}", request.uri().path());
        }
        Ok(())
    }

    fn on_message(&mut self, context: &mut UserContext, message: Message) -> Result<()> {
        context.send_message(message)
    }
}

fn handle_client(stream: TcpStream) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(60)))?;
    serve(stream, Echo)?;
    Ok(())
}

fn main() {
    env_logger::init();

    let addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:9001".to_string());
    let server = TcpListener::bind(&addr).unwrap();
    info!("Listening on {}", addr);

    for stream in server.incoming() {
        spawn(move || match stream {
            Ok(stream) => {
                if let Err(err) = handle_client(stream) {
                    match err {
                        Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => (),
                        e => warn!("Error in client: {}", e),
                    }
                }
            }
            Err(e) => error!("Error accepting stream: {}", e),
        });
    }
}
