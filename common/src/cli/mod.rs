//! CLI arguments and policy shared by the `publisher` and `listener`
//! binaries.

mod color;

pub use color::{ColorArg, ColorWhen};

use anyhow::{Context, Result};
use std::net::SocketAddr;

/// Socket and observability options every SFU binary accepts.
#[derive(clap::Args, Debug, Clone)]
pub struct EndpointArgs {
    // ---
    /// Local UDP address for RTP and RTCP (multiplexed)
    #[arg(long, default_value = "0.0.0.0:5004")]
    pub bind: String,

    /// Remote peer receiving RTCP feedback (publisher) or media (listener)
    #[arg(long)]
    pub peer: String,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9300")]
    pub metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    pub color: ColorArg,
}

impl EndpointArgs {
    // ---
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind.parse().context("invalid --bind address")
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.peer.parse().context("invalid --peer address")
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics_bind.parse().context("invalid --metrics-bind address")
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        endpoint: EndpointArgs,
    }

    #[test]
    fn test_endpoint_args_parse() {
        // ---
        let cli = TestCli::parse_from(["test", "--peer", "10.0.0.2:6000", "--color", "never"]);
        assert_eq!(cli.endpoint.peer_addr().unwrap().port(), 6000);
        assert_eq!(cli.endpoint.bind_addr().unwrap().port(), 5004);
        assert_eq!(ColorWhen::from(cli.endpoint.color), ColorWhen::Never);
    }

    #[test]
    fn test_endpoint_args_bad_address() {
        // ---
        let cli = TestCli::parse_from(["test", "--peer", "not-an-address"]);
        assert!(cli.endpoint.peer_addr().is_err());
    }
}
