use crate::hash::H256;

/// A trust anchor baked into the binary: everything at or below
/// `height` is accepted once proven against `verification_root`, the
/// merkle root over all block hashes up to that height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u64,
    pub raw_header: Vec<u8>,
    pub verification_root: H256,
}

/// Difficulty rules for the selected network.
#[derive(Copy, Clone, Debug)]
pub struct PowParams {
    pub blocks_per_adjustment: u64,
    pub target_spacing_secs: u32,
    pub target_timespan_secs: i64,
    pub proof_of_work_limit_bits: u32,
    pub allow_min_difficulty_blocks: bool,
}

/// The compile-time-selected network parameter set.
pub struct Net {
    pub name: &'static str,
    pub cashaddr_prefix: &'static str,
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    pub pow: PowParams,
    pub checkpoint_height: u64,
    pub checkpoint_header_hex: &'static str,
    pub verification_root_hex: &'static str,
    /// Seed servers as "host:port:protocol" strings.
    pub default_servers: &'static [&'static str],
}

pub const MAINNET: Net = Net {
    name: "mainnet",
    cashaddr_prefix: "bitcoincash",
    p2pkh_version: 0x00,
    p2sh_version: 0x05,
    pow: PowParams {
        blocks_per_adjustment: 2016,
        target_spacing_secs: 600,
        target_timespan_secs: 2016 * 600,
        proof_of_work_limit_bits: 0x1d00_ffff,
        allow_min_difficulty_blocks: false,
    },
    checkpoint_height: 557_957,
    checkpoint_header_hex: "000000203fd82e51a34d8eed9326e9e3b2ae1d1827aa0bd7ec64d42900000000000000002f8dc759012fb4d7d2b6eee13c0d3abb29b675b7d6221d5a75802a2e8f8c9ba6b9b0395c286e0418c38f29b9",
    verification_root_hex: "95273b17d3ba53e27fde4ad1a4de7aeab1f9e8e43f48a0db0d2a3de18c1a5d46",
    default_servers: &[
        "electrumx.bitcoinsv.io:51002:s",
        "sv.electrumx.cash:50002:s",
        "sv.satoshi.io:50002:s",
        "sv2.satoshi.io:50002:s",
        "electrumx.bot.nu:50002:s",
    ],
};

pub const TESTNET: Net = Net {
    name: "testnet",
    cashaddr_prefix: "bchtest",
    p2pkh_version: 0x6f,
    p2sh_version: 0xc4,
    pow: PowParams {
        blocks_per_adjustment: 2016,
        target_spacing_secs: 600,
        target_timespan_secs: 2016 * 600,
        proof_of_work_limit_bits: 0x1d00_ffff,
        allow_min_difficulty_blocks: true,
    },
    checkpoint_height: 1_268_885,
    checkpoint_header_hex: "00000020f99ab16ce5a2fc2dfbf9cb6b3418fefcff5e9e7b6ec5e4a1a1a68f04000000004b2e6c2a5b0f4cf0e46e19a9a33a88e6f1a96b61c6ab2e3f11f9f4d38b39eb0f5cfc305dffff001d0f5df5a2",
    verification_root_hex: "b1f1ad1a10d0fbe176115e35b3e17ab2d17260eb165a67293dcbf5d4a8fba4b4",
    default_servers: &[
        "testnet.electrumx.cash:51002:s",
        "electrontest.cascharia.com:51002:s",
    ],
};

impl Net {
    /// The network selected by cargo feature.
    #[must_use]
    pub fn selected() -> &'static Net {
        #[cfg(feature = "testnet")]
        {
            &TESTNET
        }
        #[cfg(not(feature = "testnet"))]
        {
            &MAINNET
        }
    }

    /// Decodes the baked-in checkpoint constants.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            height: self.checkpoint_height,
            raw_header: hex::decode(self.checkpoint_header_hex)
                .expect("checkpoint header constant is valid hex"),
            verification_root: self
                .verification_root_hex
                .parse()
                .expect("verification root constant is valid hex"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    #[test]
    fn checkpoint_constants_decode() {
        for net in [&MAINNET, &TESTNET] {
            let cp = net.checkpoint();
            assert_eq!(cp.raw_header.len(), Header::SIZE);
            assert!(Header::from_bytes(&cp.raw_header).is_ok());
        }
    }

    #[test]
    fn default_servers_parse_as_host_port_protocol() {
        for entry in Net::selected().default_servers {
            let mut parts = entry.rsplitn(2, ':');
            let _protocol = parts.next().unwrap();
            let rest = parts.next().unwrap();
            let port = rest.rsplitn(2, ':').next().unwrap();
            assert!(port.parse::<u16>().is_ok(), "bad seed entry {entry}");
        }
    }
}
