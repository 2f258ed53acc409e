// src/adapters/ipfs.rs

use crate::data_sources::MediaResolver;

const IPFS_SCHEME: &str = "ipfs://";

/// Rewrites `ipfs://<cid>` URIs onto an HTTP gateway; other URIs pass through.
pub struct IpfsGateway {
    gateway: String,
}

impl IpfsGateway {
    pub fn new(gateway: &str) -> Self {
        let gateway = if gateway.ends_with('/') {
            gateway.to_string()
        } else {
            format!("{}/", gateway)
        };
        Self { gateway }
    }
}

impl MediaResolver for IpfsGateway {
    fn rewrite_uri(&self, uri: &str) -> String {
        match uri.strip_prefix(IPFS_SCHEME) {
            Some(cid) => format!("{}{}", self.gateway, cid.trim_start_matches("ipfs/")),
            None => uri.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_ipfs_scheme_only() {
        let gateway = IpfsGateway::new("https://ipfs.io/ipfs");
        assert_eq!(gateway.rewrite_uri("ipfs://QmAbc"), "https://ipfs.io/ipfs/QmAbc");
        assert_eq!(gateway.rewrite_uri("ipfs://ipfs/QmAbc"), "https://ipfs.io/ipfs/QmAbc");
        assert_eq!(gateway.rewrite_uri("https://x.org/a.png"), "https://x.org/a.png");
    }
}
