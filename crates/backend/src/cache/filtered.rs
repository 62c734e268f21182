//! Rule-driven address filter decisions.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use arcflow_core::{
  Address, AddressError, Config, DomainError, ErrorDomain, config::FilterRuleConfig,
};
use moka::{
  ops::compute::{CompResult, Op},
  policy::EvictionPolicy,
  sync::Cache,
};
use regex::Regex;
use tracing::{debug, trace};

use super::{CacheArcProvider, ProviderError};
use crate::arc::{ArcKey, ArcResult, CacheArc, ConditionSet, ProcessorId, SharedArc, ValidatorSet};

/// Processor id recorded on filter decision arcs.
pub const FILTER_PROCESSOR: &str = "address-filter";

/// Raised when a filter rule cannot be evaluated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FilteredAddressError {
  #[error("Filter rule {index} ('{pattern}') is malformed: {reason}")]
  InvalidRule {
    index: usize,
    pattern: String,
    reason: String,
  },
  #[error("Filter rule {index} redirects to an invalid address '{target}': {source}")]
  InvalidRedirect {
    index: usize,
    target: String,
    #[source]
    source: AddressError,
  },
}

impl DomainError for FilteredAddressError {
  fn domain(&self) -> ErrorDomain {
    ErrorDomain::FilteredAddress
  }

  fn code(&self) -> u32 {
    match self {
      Self::InvalidRule { .. } => 1,
      Self::InvalidRedirect { .. } => 2,
    }
  }

  fn suggestion(&self) -> Option<String> {
    Some("Fix or remove the rule in the [filter] section of the configuration".to_string())
  }
}

struct CompiledRule {
  config: FilterRuleConfig,
  regex: OnceLock<Result<Regex, String>>,
}

impl CompiledRule {
  fn new(config: FilterRuleConfig) -> Self {
    Self {
      config,
      regex: OnceLock::new(),
    }
  }

  fn matcher(&self, index: usize) -> Result<&Regex, FilteredAddressError> {
    self
      .regex
      .get_or_init(|| Regex::new(self.config.pattern()).map_err(|e| e.to_string()))
      .as_ref()
      .map_err(|reason| FilteredAddressError::InvalidRule {
        index,
        pattern: self.config.pattern().to_string(),
        reason: reason.clone(),
      })
  }
}

/// Caches redirect/block decisions per address.
///
/// Rules are evaluated in order and the first match decides. Addresses no
/// rule matches produce no arc. Decision arcs carry no validators; they stay
/// valid until the rules change, they are removed, or the least recently
/// used decisions are evicted to stay within `capacity`.
pub struct FilteredAddressCache {
  rules: RwLock<Arc<Vec<CompiledRule>>>,
  decisions: Cache<Address, SharedArc>,
}

impl FilteredAddressCache {
  pub fn new(rules: Vec<FilterRuleConfig>, capacity: usize) -> Self {
    let decisions = Cache::builder()
      .max_capacity(capacity as u64)
      .eviction_policy(EvictionPolicy::lru())
      .build();
    Self {
      rules: RwLock::new(Arc::new(rules.into_iter().map(CompiledRule::new).collect())),
      decisions,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(config.filter.rules.clone(), config.cache.filter_capacity)
  }

  /// Key under which decisions for `address` are recorded.
  pub fn key_for(address: &Address) -> ArcKey {
    ArcKey::new(address.clone(), ProcessorId::new(FILTER_PROCESSOR), ConditionSet::new())
  }

  /// Decide whether `address` is redirected or blocked.
  ///
  /// `Ok(None)` means no rule applies and the address passes through.
  pub fn lookup_address(&self, address: &Address) -> Result<Option<SharedArc>, FilteredAddressError> {
    if let Some(arc) = self.decisions.get(address) {
      trace!(address = %address, arc = %arc.id(), "Filter decision hit");
      return Ok(Some(arc));
    }

    // Held across evaluate-and-install so a concurrent set_rules cannot
    // leave decisions from the old rules behind.
    let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
    let text = address.to_string();

    for (index, rule) in rules.iter().enumerate() {
      if !rule.matcher(index)?.is_match(&text) {
        continue;
      }

      let result = match &rule.config {
        FilterRuleConfig::Block { pattern } => ArcResult::Blocked {
          rule: pattern.clone(),
        },
        FilterRuleConfig::Redirect { to, .. } => {
          let target = Address::parse(to).map_err(|source| FilteredAddressError::InvalidRedirect {
            index,
            target: to.clone(),
            source,
          })?;
          ArcResult::Redirect(target.with_negotiation(address.negotiation().clone()))
        }
      };

      debug!(address = %address, rule = index, "Filter rule matched");
      let arc = CacheArc::new(Self::key_for(address), result, ValidatorSet::default()).into_shared();
      return Ok(Some(self.install(address, arc)));
    }

    Ok(None)
  }

  /// First decision installed for an address wins.
  fn install(&self, address: &Address, arc: SharedArc) -> SharedArc {
    self
      .decisions
      .entry(address.clone())
      .or_insert_with(|| arc)
      .into_value()
  }

  /// Replace the rule list and drop every cached decision.
  pub fn set_rules(&self, rules: Vec<FilterRuleConfig>) {
    let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Arc::new(rules.into_iter().map(CompiledRule::new).collect());
    self.decisions.invalidate_all();
    debug!(rules = guard.len(), "Filter rules replaced");
  }

  pub fn rule_count(&self) -> usize {
    self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// Forget any cached decision for `address`.
  pub fn invalidate_address(&self, address: &Address) -> usize {
    let doomed: Vec<SharedArc> = self
      .decisions
      .iter()
      .filter(|(cached, _)| cached.same_resource(address))
      .map(|(_, arc)| arc)
      .collect();
    doomed.iter().filter(|arc| self.remove_arc(arc)).count()
  }

  /// Remove exactly `arc`; a newer decision for the same address survives.
  pub fn remove_arc(&self, arc: &SharedArc) -> bool {
    let result = self
      .decisions
      .entry(arc.address().clone())
      .and_compute_with(|existing| match existing {
        Some(entry) if Arc::ptr_eq(entry.value(), arc) => Op::Remove,
        _ => Op::Nop,
      });
    matches!(result, CompResult::Removed(_))
  }

  pub fn len(&self) -> usize {
    self.decisions.run_pending_tasks();
    self.decisions.iter().count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl CacheArcProvider for FilteredAddressCache {
  fn name(&self) -> &'static str {
    "filtered-address"
  }

  /// Only the key's address is consulted; filter decisions do not vary by
  /// processor or conditions.
  fn lookup(&self, key: &ArcKey) -> Result<Option<SharedArc>, ProviderError> {
    Ok(self.lookup_address(key.address())?)
  }

  fn remove_arc(&self, arc: &SharedArc) -> bool {
    FilteredAddressCache::remove_arc(self, arc)
  }
}

#[cfg(test)]
mod tests {
  use arcflow_core::error::FILTERED_ADDRESS_ERROR_NAME;

  use super::*;

  fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
  }

  fn rules() -> Vec<FilterRuleConfig> {
    vec![
      FilterRuleConfig::Block {
        pattern: r"^https?://ads\.".to_string(),
      },
      FilterRuleConfig::Redirect {
        pattern: r"^http://old\.example\.com/".to_string(),
        to: "https://new.example.com/".to_string(),
      },
    ]
  }

  #[test]
  fn test_unmatched_address_passes_through() {
    let cache = FilteredAddressCache::new(rules(), 16);
    assert!(cache.lookup_address(&addr("https://example.com/")).unwrap().is_none());
    assert!(cache.is_empty());
  }

  #[test]
  fn test_block_and_redirect_decisions() {
    let cache = FilteredAddressCache::new(rules(), 16);

    let blocked = cache.lookup_address(&addr("http://ads.example.com/x")).unwrap().unwrap();
    assert!(matches!(blocked.result(), ArcResult::Blocked { rule } if rule == r"^https?://ads\."));

    let redirected = cache.lookup_address(&addr("http://old.example.com/page")).unwrap().unwrap();
    match redirected.result() {
      ArcResult::Redirect(to) => assert_eq!(to.to_string(), "https://new.example.com/"),
      other => panic!("expected redirect, got {:?}", other),
    }
    assert_eq!(redirected.key().processor().as_str(), FILTER_PROCESSOR);
  }

  #[test]
  fn test_decisions_are_shared() {
    let cache = FilteredAddressCache::new(rules(), 16);
    let a = cache.lookup_address(&addr("http://ads.example.com/")).unwrap().unwrap();
    let b = cache.lookup_address(&addr("http://ads.example.com/")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[test]
  fn test_malformed_rule_reports_filtered_address_domain() {
    let cache = FilteredAddressCache::new(
      vec![FilterRuleConfig::Block {
        pattern: "([unclosed".to_string(),
      }],
      16,
    );
    let err = cache.lookup_address(&addr("http://example.com/")).unwrap_err();
    assert!(matches!(err, FilteredAddressError::InvalidRule { index: 0, .. }));
    assert_eq!(err.report().domain, FILTERED_ADDRESS_ERROR_NAME);
    assert_eq!(err.domain(), ErrorDomain::FilteredAddress);
  }

  #[test]
  fn test_full_cache_evicts_least_recently_used() {
    let cache = FilteredAddressCache::new(rules(), 2);
    for i in 1..=3 {
      cache
        .lookup_address(&addr(&format!("http://ads.example.com/{}", i)))
        .unwrap()
        .unwrap();
    }
    assert_eq!(cache.len(), 2);

    // Newest decisions keep being cached once full
    let newest = cache.lookup_address(&addr("http://ads.example.com/3")).unwrap().unwrap();
    let again = cache.lookup_address(&addr("http://ads.example.com/3")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&newest, &again));

    let fourth = cache.lookup_address(&addr("http://ads.example.com/4")).unwrap().unwrap();
    assert!(Arc::ptr_eq(
      &fourth,
      &cache.lookup_address(&addr("http://ads.example.com/4")).unwrap().unwrap()
    ));
    assert_eq!(cache.len(), 2);
  }

  #[test]
  fn test_set_rules_clears_decisions() {
    let cache = FilteredAddressCache::new(rules(), 16);
    cache.lookup_address(&addr("http://ads.example.com/")).unwrap().unwrap();
    cache.set_rules(Vec::new());
    assert!(cache.is_empty());
    assert!(cache.lookup_address(&addr("http://ads.example.com/")).unwrap().is_none());
  }

  #[test]
  fn test_remove_arc_by_identity() {
    let cache = FilteredAddressCache::new(rules(), 16);
    let arc = cache.lookup_address(&addr("http://ads.example.com/")).unwrap().unwrap();
    assert!(cache.remove_arc(&arc));
    assert!(!cache.remove_arc(&arc));

    let fresh = cache.lookup_address(&addr("http://ads.example.com/")).unwrap().unwrap();
    assert!(!Arc::ptr_eq(&arc, &fresh));
    assert!(!cache.remove_arc(&arc));
    assert_eq!(cache.len(), 1);
  }
}
