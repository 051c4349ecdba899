//! Client identity sent with every registration

use edgetunnel_proto::ClientInfo;
use uuid::Uuid;

/// Features this client advertises to the edge
pub const DEFAULT_FEATURES: &[&str] = &["serialized_headers", "support_datagram_v2"];

pub fn client_info(connector_id: Uuid, features: &[&str]) -> ClientInfo {
    ClientInfo {
        client_id: connector_id.as_bytes().to_vec(),
        features: features.iter().map(|f| f.to_string()).collect(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        arch: format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info() {
        let id = Uuid::new_v4();
        let info = client_info(id, DEFAULT_FEATURES);

        assert_eq!(info.client_id, id.as_bytes());
        assert_eq!(info.features.len(), 2);
        assert!(!info.version.is_empty());
        assert!(info.arch.contains('_'));
    }
}
