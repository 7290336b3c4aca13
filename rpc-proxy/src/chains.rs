use crate::config::ChainConfig;
use std::collections::HashMap;
use url::Url;

/// Placeholder substituted with the provider API key in chain URL templates.
pub const API_KEY_PLACEHOLDER: &str = "{api_key}";

#[derive(thiserror::Error, Debug)]
pub enum ChainTableError {
    #[error("invalid upstream url for chain {chain_id}: {source}")]
    InvalidUrl {
        chain_id: u64,
        #[source]
        source: url::ParseError,
    },

    #[error("upstream url for chain {chain_id} must use http or https, got {scheme}")]
    UnsupportedScheme { chain_id: u64, scheme: String },
}

/// Chains served when the configuration does not list its own.
pub fn default_chains() -> Vec<ChainConfig> {
    [
        (1, "https://eth-mainnet.g.alchemy.com/v2/{api_key}"),
        (10, "https://opt-mainnet.g.alchemy.com/v2/{api_key}"),
        (130, "https://unichain-mainnet.g.alchemy.com/v2/{api_key}"),
        (137, "https://polygon-mainnet.g.alchemy.com/v2/{api_key}"),
        (999, "https://rpc.hyperliquid.xyz/evm"),
        (8453, "https://base-mainnet.g.alchemy.com/v2/{api_key}"),
        (42161, "https://arb-mainnet.g.alchemy.com/v2/{api_key}"),
    ]
    .into_iter()
    .map(|(chain_id, url)| ChainConfig {
        chain_id,
        url: url.to_string(),
    })
    .collect()
}

/// Immutable chain id to upstream URL mapping, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct ChainEndpointTable {
    endpoints: HashMap<u64, Url>,
}

impl ChainEndpointTable {
    /// Resolves every template against `api_key`.
    ///
    /// Templates that need a key are left out when no (non-blank) key is
    /// given, so the table never holds a URL with a missing credential.
    pub fn build(
        chains: &[ChainConfig],
        api_key: Option<&str>,
    ) -> Result<Self, ChainTableError> {
        let api_key = api_key.map(str::trim).filter(|key| !key.is_empty());
        let mut endpoints = HashMap::with_capacity(chains.len());

        for chain in chains {
            let needs_key = chain.url.contains(API_KEY_PLACEHOLDER);
            let raw_url = match (needs_key, api_key) {
                (false, _) => chain.url.clone(),
                (true, Some(key)) => chain.url.replace(API_KEY_PLACEHOLDER, key),
                (true, None) => {
                    tracing::warn!(
                        chain_id = chain.chain_id,
                        "No API key configured, chain disabled"
                    );
                    continue;
                }
            };

            let url =
                Url::parse(raw_url.trim()).map_err(|source| ChainTableError::InvalidUrl {
                    chain_id: chain.chain_id,
                    source,
                })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ChainTableError::UnsupportedScheme {
                    chain_id: chain.chain_id,
                    scheme: url.scheme().to_string(),
                });
            }

            endpoints.insert(chain.chain_id, url);
        }

        Ok(ChainEndpointTable { endpoints })
    }

    pub fn from_urls(urls: impl IntoIterator<Item = (u64, Url)>) -> Self {
        ChainEndpointTable {
            endpoints: urls.into_iter().collect(),
        }
    }

    pub fn resolve(&self, chain_id: u64) -> Option<&Url> {
        self.endpoints.get(&chain_id)
    }

    /// Served chain ids in ascending order
    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.endpoints.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_api_key() {
        let table = ChainEndpointTable::build(&default_chains(), Some("secret")).unwrap();
        assert_eq!(table.chain_ids(), vec![1, 10, 130, 137, 999, 8453, 42161]);
        assert_eq!(
            table.resolve(1).unwrap().as_str(),
            "https://eth-mainnet.g.alchemy.com/v2/secret"
        );
        assert_eq!(
            table.resolve(999).unwrap().as_str(),
            "https://rpc.hyperliquid.xyz/evm"
        );
        assert!(table.resolve(999999).is_none());
    }

    #[test]
    fn test_missing_api_key_excludes_dependent_chains() {
        for api_key in [None, Some(""), Some("   ")] {
            let table = ChainEndpointTable::build(&default_chains(), api_key).unwrap();
            assert_eq!(table.chain_ids(), vec![999]);
            assert!(table.resolve(1).is_none());
        }
    }

    #[test]
    fn test_invalid_templates() {
        let chains = vec![ChainConfig {
            chain_id: 5,
            url: "not a url".to_string(),
        }];
        assert!(matches!(
            ChainEndpointTable::build(&chains, None),
            Err(ChainTableError::InvalidUrl { chain_id: 5, .. })
        ));

        let chains = vec![ChainConfig {
            chain_id: 5,
            url: "ws://node.example/{api_key}".to_string(),
        }];
        assert!(matches!(
            ChainEndpointTable::build(&chains, Some("key")),
            Err(ChainTableError::UnsupportedScheme { chain_id: 5, .. })
        ));

        // A broken key-dependent template is not checked when it is excluded
        let chains = vec![ChainConfig {
            chain_id: 5,
            url: "{api_key}".to_string(),
        }];
        assert!(ChainEndpointTable::build(&chains, None).unwrap().is_empty());
    }
}
