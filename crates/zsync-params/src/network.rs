//! Zcash network definitions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// Mainnet
    Mainnet,
    /// Testnet
    Testnet,
    /// Regtest (local development)
    Regtest,
}

impl NetworkType {
    /// Parse the chain name reported by lightwalletd (`main`, `test`, `regtest`)
    pub fn from_chain_name(name: &str) -> Result<Self> {
        match name {
            "main" => Ok(Self::Mainnet),
            "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }

    /// Chain name as reported by lightwalletd
    pub const fn chain_name(&self) -> &'static str {
        match self {
            Self::Mainnet => "main",
            Self::Testnet => "test",
            Self::Regtest => "regtest",
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Coin type (BIP-44)
    pub coin_type: u32,
    /// Overwinter activation height
    pub overwinter_activation_height: u64,
    /// Sapling activation height
    pub sapling_activation_height: u64,
    /// Blossom activation height
    pub blossom_activation_height: u64,
    /// Heartwood activation height
    pub heartwood_activation_height: u64,
    /// Canopy activation height
    pub canopy_activation_height: u64,
    /// NU5 (Orchard) activation height
    pub nu5_activation_height: u64,
    /// NU6 activation height
    pub nu6_activation_height: Option<u64>,
}

impl Network {
    /// Get mainnet parameters
    pub const fn mainnet() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            name: "mainnet",
            coin_type: 133,
            overwinter_activation_height: 347_500,
            sapling_activation_height: 419_200,
            blossom_activation_height: 653_600,
            heartwood_activation_height: 903_000,
            canopy_activation_height: 1_046_400,
            nu5_activation_height: 1_687_104,
            nu6_activation_height: Some(2_726_400),
        }
    }

    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            coin_type: 1,
            overwinter_activation_height: 207_500,
            sapling_activation_height: 280_000,
            blossom_activation_height: 584_000,
            heartwood_activation_height: 903_800,
            canopy_activation_height: 1_028_500,
            nu5_activation_height: 1_842_420,
            nu6_activation_height: Some(2_976_000),
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            coin_type: 1,
            overwinter_activation_height: 1,
            sapling_activation_height: 1,
            blossom_activation_height: 1,
            heartwood_activation_height: 1,
            canopy_activation_height: 1,
            nu5_activation_height: 1,
            nu6_activation_height: None,
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Chain name as reported by lightwalletd
    pub const fn chain_name(&self) -> &'static str {
        self.network_type.chain_name()
    }

    /// Check if Sapling is activated at given height
    pub const fn is_sapling_active(&self, height: u64) -> bool {
        height >= self.sapling_activation_height
    }

    /// Check if Orchard is activated at given height
    pub const fn is_orchard_active(&self, height: u64) -> bool {
        height >= self.nu5_activation_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_params() {
        let net = Network::mainnet();
        assert_eq!(net.network_type, NetworkType::Mainnet);
        assert_eq!(net.coin_type, 133);
        assert_eq!(net.sapling_activation_height, 419_200);
        assert!(net.is_sapling_active(500_000));
        assert!(!net.is_orchard_active(1_600_000));
        assert!(net.is_orchard_active(1_700_000));
    }

    #[test]
    fn test_network_from_type() {
        let net = Network::from_type(NetworkType::Testnet);
        assert_eq!(net.network_type, NetworkType::Testnet);
        assert_eq!(net.sapling_activation_height, 280_000);
    }

    #[test]
    fn test_chain_names() {
        assert_eq!(NetworkType::from_chain_name("main").unwrap(), NetworkType::Mainnet);
        assert_eq!(NetworkType::from_chain_name("test").unwrap(), NetworkType::Testnet);
        assert_eq!(Network::testnet().chain_name(), "test");
        assert!(NetworkType::from_chain_name("mainnet").is_err());
    }
}
