//! Selection of viable backends: the strategy contract and registry, plus
//! the [`Selector`] that fans out across locators and applies the active
//! strategy to the aggregated candidates.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::locator::{Locator, LocatorError, PrometheusEndpoint};

pub mod strategy;

/// One selection snapshot: every candidate any locator returned this round,
/// and the parsed URLs of those the strategy marked selected.
#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub candidates: Vec<PrometheusEndpoint>,
    pub selection: Vec<Url>,
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("No endpoints returned by any locators")]
    NoCandidates,
    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("No selector strategy named '{0}' found")]
    UnknownStrategy(String),
    #[error("Strategy {name} requires a {what} argument")]
    MissingArgument {
        name: &'static str,
        what: &'static str,
    },
    #[error("Invalid {what} value '{value}' for {name}: {reason}")]
    InvalidArgument {
        name: &'static str,
        what: &'static str,
        value: String,
        reason: String,
    },
    #[error("No valid/responding endpoints found in the provided list: [{candidates}]")]
    NoneSelected { candidates: String },
}

impl StrategyError {
    /// Build the none-selected error carrying the candidate list.
    pub fn none_selected(candidates: &[PrometheusEndpoint]) -> Self {
        Self::NoneSelected {
            candidates: candidates
                .iter()
                .map(|endpoint| endpoint.address.clone())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// A pluggable policy for choosing which candidates are eligible and which
/// target fields the next request.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Unique name, including any arguments it was built with.
    fn name(&self) -> String;

    /// Human-readable description for the status surface.
    fn description(&self) -> &'static str;

    /// Name of the metric or calculation used to rank candidates.
    fn comparison_metric_name(&self) -> &'static str;

    /// Whether routing under this strategy benefits from sticky sessions.
    fn requires_sticky_sessions(&self) -> bool;

    /// Index of the target that should field the next request.
    fn next_index(&self, targets: &[Url]) -> usize;

    /// Mark the eligible candidates; errors iff nothing was selected.
    async fn select(&self, candidates: &mut [PrometheusEndpoint]) -> Result<(), StrategyError>;
}

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Factory building a strategy from optional string arguments.
pub type StrategyFactory =
    fn(&reqwest::Client, &[String]) -> Result<Arc<dyn Strategy>, StrategyError>;

static STRATEGIES: LazyLock<RwLock<HashMap<&'static str, StrategyFactory>>> =
    LazyLock::new(|| {
        let mut registry: HashMap<&'static str, StrategyFactory> = HashMap::new();
        registry.insert(strategy::single_most_data::NAME, strategy::single_most_data::create);
        registry.insert(strategy::random::NAME, strategy::random::create);
        registry.insert(strategy::minimum_history::NAME, strategy::minimum_history::create);
        RwLock::new(registry)
    });

/// Register a strategy factory under a unique name. The registry is
/// append-only: a name already taken is left untouched.
#[allow(dead_code)] // Extension point for strategies defined outside this module
pub fn register_strategy(name: &'static str, factory: StrategyFactory) {
    STRATEGIES
        .write()
        .expect("strategy registry poisoned")
        .entry(name)
        .or_insert(factory);
}

/// Instantiate a registered strategy by name.
pub fn create_strategy(
    client: &reqwest::Client,
    name: &str,
    args: &[String],
) -> Result<Arc<dyn Strategy>, StrategyError> {
    let factory = STRATEGIES
        .read()
        .expect("strategy registry poisoned")
        .get(name)
        .copied()
        .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))?;
    factory(client, args)
}

/// Aggregates candidates from every configured locator and applies the
/// active strategy.
pub struct Selector {
    locators: Vec<Box<dyn Locator>>,
    pub strategy: Arc<dyn Strategy>,
}

impl Selector {
    /// Build a selector from `strategy_args` of the form `[name, arg...]`.
    pub fn new(
        client: &reqwest::Client,
        locators: Vec<Box<dyn Locator>>,
        strategy_args: &[String],
    ) -> Result<Self, StrategyError> {
        let (name, args) = strategy_args
            .split_first()
            .ok_or_else(|| StrategyError::UnknownStrategy(String::new()))?;
        let strategy = create_strategy(client, name, args)?;
        Ok(Self { locators, strategy })
    }

    /// Run one full selection round.
    ///
    /// The result is returned even when an error occurred, so callers can
    /// surface the candidates that were found along the way.
    pub async fn select(&self) -> (SelectionResult, Option<SelectorError>) {
        let mut result = SelectionResult::default();

        for locator in &self.locators {
            match locator.endpoints().await {
                Ok(endpoints) => {
                    debug!(locator = %locator.describe(), count = endpoints.len(),
                        "locator resolved endpoints");
                    result.candidates.extend(endpoints);
                }
                Err(LocatorError::Partial { endpoints, reason }) => {
                    warn!(locator = %locator.describe(), %reason,
                        "locator returned partial results");
                    result.candidates.extend(endpoints);
                }
                Err(err) => {
                    error!(locator = %locator.describe(), error = %err,
                        "locator failed to resolve endpoints");
                }
            }
        }
        if result.candidates.is_empty() {
            return (result, Some(SelectorError::NoCandidates));
        }

        if let Err(err) = self.strategy.select(&mut result.candidates).await {
            return (result, Some(err.into()));
        }

        for endpoint in &result.candidates {
            if !endpoint.selected {
                continue;
            }
            match Url::parse(&endpoint.address) {
                Ok(url) if url.has_host() => result.selection.push(url),
                Ok(_) => error!(selection = %endpoint.address,
                    "selected address has no host; dropping from selection"),
                Err(err) => error!(selection = %endpoint.address, error = %err,
                    "failed to parse selected address; dropping from selection"),
            }
        }
        (result, None)
    }
}
