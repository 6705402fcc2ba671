use std::{fmt::Debug, net::SocketAddr};

use crate::options::EndPoint;

/// Translates node addresses discovered in `system.peers` before the driver connects
/// to them, for deployments where clients reach nodes through a different network
/// than the nodes use among themselves. Contact points are never translated.
pub trait AddressTranslator: Send + Sync + Debug {
    /// Maps a broadcast address to the endpoint the driver should dial.
    fn translate(&self, address: SocketAddr) -> EndPoint;
}

/// The default translator: use the address as reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityAddressTranslator;

impl AddressTranslator for IdentityAddressTranslator {
    fn translate(&self, address: SocketAddr) -> EndPoint {
        EndPoint::new(address.ip().to_string(), address.port())
    }
}
