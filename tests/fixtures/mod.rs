//! Test fixtures.

mod tunnel_pair;

pub use tunnel_pair::{
    EchoServer, EndpointSetup, FixtureError, TunnelPair, bind_loopback, connect_and_echo,
    eventually,
};
