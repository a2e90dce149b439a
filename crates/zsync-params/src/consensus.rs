//! Network upgrades and consensus branch IDs

use crate::network::Network;
use crate::{Error, Result};

/// Network upgrades that change the consensus branch ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkUpgrade {
    /// Overwinter
    Overwinter,
    /// Sapling
    Sapling,
    /// Blossom
    Blossom,
    /// Heartwood
    Heartwood,
    /// Canopy
    Canopy,
    /// NU5
    Nu5,
    /// NU6
    Nu6,
}

impl NetworkUpgrade {
    const ALL: [NetworkUpgrade; 7] = [
        NetworkUpgrade::Overwinter,
        NetworkUpgrade::Sapling,
        NetworkUpgrade::Blossom,
        NetworkUpgrade::Heartwood,
        NetworkUpgrade::Canopy,
        NetworkUpgrade::Nu5,
        NetworkUpgrade::Nu6,
    ];

    /// Consensus branch ID introduced by this upgrade
    pub const fn branch_id(&self) -> BranchId {
        BranchId(match self {
            Self::Overwinter => 0x5ba8_1b19,
            Self::Sapling => 0x76b8_09bb,
            Self::Blossom => 0x2bb4_0e60,
            Self::Heartwood => 0xf5b9_230b,
            Self::Canopy => 0xe9ff_75a6,
            Self::Nu5 => 0xc2d6_d0b4,
            Self::Nu6 => 0xc8e7_1055,
        })
    }

    /// Activation height of this upgrade on the given network
    pub const fn activation_height(&self, network: &Network) -> Option<u64> {
        match self {
            Self::Overwinter => Some(network.overwinter_activation_height),
            Self::Sapling => Some(network.sapling_activation_height),
            Self::Blossom => Some(network.blossom_activation_height),
            Self::Heartwood => Some(network.heartwood_activation_height),
            Self::Canopy => Some(network.canopy_activation_height),
            Self::Nu5 => Some(network.nu5_activation_height),
            Self::Nu6 => network.nu6_activation_height,
        }
    }

    /// Latest upgrade active at `height`, if any
    pub fn active_at(network: &Network, height: u64) -> Option<Self> {
        Self::ALL.iter().rev().copied().find(|upgrade| {
            upgrade
                .activation_height(network)
                .map(|activation| height >= activation)
                .unwrap_or(false)
        })
    }
}

/// A consensus branch ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(pub u32);

impl BranchId {
    /// Sprout (pre-Overwinter) branch ID
    pub const SPROUT: BranchId = BranchId(0);

    /// Branch ID in effect at `height` on `network`
    pub fn for_height(network: &Network, height: u64) -> Self {
        NetworkUpgrade::active_at(network, height)
            .map(|upgrade| upgrade.branch_id())
            .unwrap_or(Self::SPROUT)
    }

    /// Parse the hex form reported by lightwalletd (e.g. `c2d6d0b4`)
    pub fn parse_hex(value: &str) -> Result<Self> {
        let trimmed = value.trim().trim_start_matches("0x");
        u32::from_str_radix(trimmed, 16)
            .map(BranchId)
            .map_err(|_| Error::InvalidBranchId(value.to_string()))
    }

    /// Lowercase hex form without prefix
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_id_for_height() {
        let net = Network::mainnet();
        assert_eq!(BranchId::for_height(&net, 1), BranchId::SPROUT);
        assert_eq!(BranchId::for_height(&net, 419_200), BranchId(0x76b8_09bb));
        assert_eq!(BranchId::for_height(&net, 1_687_103), BranchId(0xe9ff_75a6));
        assert_eq!(BranchId::for_height(&net, 1_687_104), BranchId(0xc2d6_d0b4));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(BranchId::parse_hex("c2d6d0b4").unwrap(), BranchId(0xc2d6_d0b4));
        assert_eq!(BranchId::parse_hex("0x76b809bb").unwrap(), BranchId(0x76b8_09bb));
        assert!(BranchId::parse_hex("not-hex").is_err());
        assert_eq!(BranchId(0xc2d6_d0b4).to_hex(), "c2d6d0b4");
    }

    #[test]
    fn test_regtest_without_nu6() {
        let net = Network::regtest();
        assert_eq!(NetworkUpgrade::active_at(&net, 10), Some(NetworkUpgrade::Nu5));
    }
}
