//! Next hops read from the config file.

use async_trait::async_trait;
use dashmap::DashMap;
use duplex_core::{Addr, ChannelId, RoutingUpdate};
use duplex_engine::{EngineError, Router};

use crate::config::StaticRoute;

/// Router over `[[network.routes]]` entries. Routing updates from peers are
/// logged and otherwise ignored.
#[derive(Default)]
pub struct ConfigRouter {
    routes: DashMap<(Addr, Addr), (ChannelId, Addr)>,
}

impl ConfigRouter {
    pub fn from_config(routes: &[StaticRoute]) -> anyhow::Result<Self> {
        let router = Self::default();
        for route in routes {
            let dest = Addr::from_hex(&route.dest)?;
            let token = Addr::from_hex(&route.token)?;
            let cid = ChannelId::from_hex(&route.cid)?;
            let next_hop = Addr::from_hex(&route.next_hop)?;
            router.routes.insert((dest, token), (cid, next_hop));
        }
        Ok(router)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl Router for ConfigRouter {
    fn lookup_next_channel(&self, dest: &Addr, token: &Addr) -> Option<(ChannelId, Addr)> {
        self.routes.get(&(*dest, *token)).map(|r| *r)
    }

    async fn handle_routing_request(
        &self,
        from: &Addr,
        updates: Vec<RoutingUpdate>,
    ) -> Result<(), EngineError> {
        tracing::debug!(peer = %from, count = updates.len(), "ignoring routing updates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_from_config() {
        let route = StaticRoute {
            dest: hex::encode([3u8; 32]),
            token: hex::encode([0u8; 32]),
            cid: hex::encode([9u8; 32]),
            next_hop: hex::encode([2u8; 32]),
        };
        let router = ConfigRouter::from_config(&[route]).unwrap();
        assert_eq!(router.len(), 1);
        assert_eq!(
            router.lookup_next_channel(&Addr([3; 32]), &Addr::ZERO),
            Some((ChannelId([9; 32]), Addr([2; 32])))
        );
        assert_eq!(router.lookup_next_channel(&Addr([4; 32]), &Addr::ZERO), None);
    }

    #[test]
    fn test_bad_route_rejected() {
        let route = StaticRoute {
            dest: "zz".into(),
            token: hex::encode([0u8; 32]),
            cid: hex::encode([9u8; 32]),
            next_hop: hex::encode([2u8; 32]),
        };
        assert!(ConfigRouter::from_config(&[route]).is_err());
    }
}
