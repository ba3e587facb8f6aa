//! Deterministic subnet allocation for data networks.
//!
//! Data networks draw /16 blocks from the non-masquerade 16.0.0.0/4 space
//! in a fixed sequence: 16.0.0.0/16, 16.1.0.0/16, ... 31.255.0.0/16. The
//! k-th data network ever created uses the k-th entry, where k is the
//! number of data networks already present on the engine. The sequence and
//! the control-network constants are part of the runner's external
//! contract.

use std::net::Ipv4Addr;

use crate::error::RunnerError;
use crate::runtime::Subnet;

/// Subnet of the long-lived control network.
pub const CONTROL_SUBNET: Subnet = Subnet::new(Ipv4Addr::new(192, 18, 0, 0), 16);

/// Gateway address of the control network.
pub const CONTROL_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 18, 0, 1);

/// Number of /16 blocks in 16.0.0.0/4.
pub const DATA_NETWORK_CAPACITY: usize = 4096;

/// Return the `existing`-th data subnet and its gateway.
///
/// `existing` is the count of data networks currently present; the result
/// never overlaps [`CONTROL_SUBNET`].
pub fn next_data_network(existing: usize) -> Result<(Subnet, Ipv4Addr), RunnerError> {
    if existing >= DATA_NETWORK_CAPACITY {
        return Err(RunnerError::AddressSpaceExhausted);
    }
    let first = 16 + (existing / 256) as u8;
    let second = (existing % 256) as u8;
    let subnet = Subnet::new(Ipv4Addr::new(first, second, 0, 0), 16);
    let gateway = Ipv4Addr::new(first, second, 0, 1);
    Ok((subnet, gateway))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_16_0() {
        let (subnet, gateway) = next_data_network(0).unwrap();
        assert_eq!(subnet.to_string(), "16.0.0.0/16");
        assert_eq!(gateway, Ipv4Addr::new(16, 0, 0, 1));
    }

    #[test]
    fn sequence_wraps_second_octet_into_first() {
        let (subnet, _) = next_data_network(255).unwrap();
        assert_eq!(subnet.to_string(), "16.255.0.0/16");
        let (subnet, gateway) = next_data_network(256).unwrap();
        assert_eq!(subnet.to_string(), "17.0.0.0/16");
        assert_eq!(gateway, Ipv4Addr::new(17, 0, 0, 1));
    }

    #[test]
    fn last_entry_then_exhaustion() {
        let (subnet, _) = next_data_network(DATA_NETWORK_CAPACITY - 1).unwrap();
        assert_eq!(subnet.to_string(), "31.255.0.0/16");
        assert!(matches!(
            next_data_network(DATA_NETWORK_CAPACITY),
            Err(RunnerError::AddressSpaceExhausted)
        ));
    }

    #[test]
    fn gateway_lies_inside_its_subnet() {
        for k in [0, 1, 100, 4095] {
            let (subnet, gateway) = next_data_network(k).unwrap();
            assert!(subnet.contains(gateway), "gateway outside subnet at k={k}");
        }
    }

    #[test]
    fn entire_sequence_is_disjoint_from_control_subnet() {
        for k in 0..DATA_NETWORK_CAPACITY {
            let (subnet, _) = next_data_network(k).unwrap();
            assert!(
                !subnet.overlaps(&CONTROL_SUBNET),
                "data subnet {subnet} overlaps control subnet at k={k}"
            );
        }
    }

    #[test]
    fn consecutive_entries_do_not_overlap() {
        let (a, _) = next_data_network(7).unwrap();
        let (b, _) = next_data_network(8).unwrap();
        assert!(!a.overlaps(&b));
    }
}
