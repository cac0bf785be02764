//! Names for the `OVS_KEY_ATTR_*` flow key attribute space.
//!
//! The table mirrors `enum ovs_key_attr` from the datapath's
//! `openvswitch.h`; the index is the attribute code. New protocol versions
//! extend the table, decode logic never depends on it.

/// Returned for codes outside the table.
pub const UNKNOWN_ATTR: &str = "<UNKNOWN>";

const OVS_KEY_ATTRS: [&str; 29] = [
    "OVS_KEY_ATTR_UNSPEC",
    "OVS_KEY_ATTR_ENCAP",
    "OVS_KEY_ATTR_PRIORITY",
    "OVS_KEY_ATTR_IN_PORT",
    "OVS_KEY_ATTR_ETHERNET",
    "OVS_KEY_ATTR_VLAN",
    "OVS_KEY_ATTR_ETHERTYPE",
    "OVS_KEY_ATTR_IPV4",
    "OVS_KEY_ATTR_IPV6",
    "OVS_KEY_ATTR_TCP",
    "OVS_KEY_ATTR_UDP",
    "OVS_KEY_ATTR_ICMP",
    "OVS_KEY_ATTR_ICMPV6",
    "OVS_KEY_ATTR_ARP",
    "OVS_KEY_ATTR_ND",
    "OVS_KEY_ATTR_SKB_MARK",
    "OVS_KEY_ATTR_TUNNEL",
    "OVS_KEY_ATTR_SCTP",
    "OVS_KEY_ATTR_TCP_FLAGS",
    "OVS_KEY_ATTR_DP_HASH",
    "OVS_KEY_ATTR_RECIRC_ID",
    "OVS_KEY_ATTR_MPLS",
    "OVS_KEY_ATTR_CT_STATE",
    "OVS_KEY_ATTR_CT_ZONE",
    "OVS_KEY_ATTR_CT_MARK",
    "OVS_KEY_ATTR_CT_LABELS",
    "OVS_KEY_ATTR_CT_ORIG_TUPLE_IPV4",
    "OVS_KEY_ATTR_CT_ORIG_TUPLE_IPV6",
    "OVS_KEY_ATTR_NSH",
];

/// Attribute codes the rest of the crate refers to by name.
pub mod attr {
    pub const PRIORITY: u16 = 2;
    pub const IN_PORT: u16 = 3;
    pub const ETHERNET: u16 = 4;
    pub const ETHERTYPE: u16 = 6;
    pub const IPV4: u16 = 7;
    pub const UDP: u16 = 10;
    pub const ICMP: u16 = 11;
    pub const SKB_MARK: u16 = 15;
    pub const DP_HASH: u16 = 19;
    pub const RECIRC_ID: u16 = 20;
    pub const CT_STATE: u16 = 22;
    pub const CT_ZONE: u16 = 23;
    pub const CT_MARK: u16 = 24;
}

/// Symbolic name for `code`, or [`UNKNOWN_ATTR`].
///
/// The bound is strict: `code == OVS_KEY_ATTRS.len()` is unknown too, where
/// a `code > len` check would index one past the table.
///
/// Takes a signed code so callers holding arbitrary integers get the
/// sentinel for negatives instead of a wrap-around hit.
pub fn name_for(code: i64) -> &'static str {
    usize::try_from(code)
        .ok()
        .and_then(|idx| OVS_KEY_ATTRS.get(idx).copied())
        .unwrap_or(UNKNOWN_ATTR)
}

/// Number of known attribute codes.
pub fn known_attrs() -> usize {
    OVS_KEY_ATTRS.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_resolve() {
        assert_eq!(name_for(0), "OVS_KEY_ATTR_UNSPEC");
        assert_eq!(name_for(attr::IN_PORT.into()), "OVS_KEY_ATTR_IN_PORT");
        assert_eq!(name_for(19), "OVS_KEY_ATTR_DP_HASH");
        assert_eq!(name_for(28), "OVS_KEY_ATTR_NSH");
    }

    #[test]
    fn out_of_range_is_unknown() {
        assert_eq!(name_for(-1), UNKNOWN_ATTR);
        assert_eq!(name_for(known_attrs() as i64), UNKNOWN_ATTR);
        assert_eq!(name_for(i64::from(u16::MAX)), UNKNOWN_ATTR);
    }

    #[test]
    fn last_index_is_valid() {
        let last = known_attrs() as i64 - 1;
        assert_ne!(name_for(last), UNKNOWN_ATTR);
    }
}
