//! Cross-domain access policy responder.
//!
//! Legacy socket clients connect to a well-known port before opening their
//! real connection and expect an XML policy document in return. This module
//! answers them; it shares nothing with the framing engine.

use std::io::{self, Read, Write};

use log::*;

/// The port legacy clients ask for the policy on.
pub const POLICY_PORT: u16 = 843;

/// Bytes read from the client before answering.
const REQUEST_SIZE: usize = 32;

/// A cross-domain policy allowing one origin domain on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    domain: String,
    port: u16,
}

impl AccessPolicy {
    /// Allow `domain` to connect to `port`. An empty domain allows any origin.
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        let domain = domain.into();
        let domain = if domain.is_empty() { "*".to_owned() } else { domain };
        AccessPolicy { domain, port }
    }

    /// The allowed origin domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The allowed port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The NUL-terminated policy document.
    pub fn document(&self) -> String {
        format!(
            "<cross-domain-policy>\r\n\
             \t<allow-access-from domain=\"{}\" to-ports=\"{}\" />\r\n\
             </cross-domain-policy>\r\n\0",
            self.domain, self.port
        )
    }

    /// Answer one client: read its request, write the document.
    ///
    /// The request content is ignored. The caller closes the stream afterwards.
    pub fn respond<S: Read + Write>(&self, mut stream: S) -> io::Result<()> {
        let mut request = [0u8; REQUEST_SIZE];
        let size = stream.read(&mut request)?;
        trace!("Policy request: {:?}", String::from_utf8_lossy(&request[..size]));
        stream.write_all(self.document().as_bytes())?;
        stream.flush()
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        AccessPolicy::new("*", 80)
    }
}
