use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use veilchain_chain::ChainEngine;
use veilchain_core::{Block, CancelToken, LedgerError};
use veilchain_storage::BlockDao;

use crate::router::{route, QueryHints, SearchMode};

const SCAN_PAGE: usize = 256;
const DEFAULT_MAX_RESULTS: usize = 100;

/// Which layer produced a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchOrigin {
    Public,
    Private,
    Content,
    OffChain,
}

impl MatchOrigin {
    /// Rarity weight for scoring. The harder a layer is to reach, the more
    /// a match there is worth.
    fn weight(self) -> f64 {
        match self {
            MatchOrigin::Public => 1.0,
            MatchOrigin::Content => 1.5,
            MatchOrigin::Private => 2.0,
            MatchOrigin::OffChain => 2.5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub terms: Vec<String>,
    /// Explicit strategy; `None` lets the router decide.
    pub mode: Option<SearchMode>,
    pub password: Option<String>,
    /// Restrict to blocks addressed to this recipient (authenticated only).
    pub recipient: Option<String>,
    pub max_results: usize,
    pub hints: QueryHints,
}

impl SearchQuery {
    pub fn terms(terms: &[&str]) -> Self {
        Self {
            terms: terms.iter().map(|s| s.to_string()).collect(),
            mode: None,
            password: None,
            recipient: None,
            max_results: DEFAULT_MAX_RESULTS,
            hints: QueryHints::default(),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Clone, Debug)]
pub struct SearchHit {
    pub block_number: u64,
    pub matched_terms: Vec<String>,
    pub origins: Vec<MatchOrigin>,
    /// Deterministic TF-style relevance: each (term, layer) match adds the
    /// layer's rarity weight.
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Set when the deep scan hit its deadline or the result cap bit.
    pub truncated: bool,
}

#[derive(Default)]
struct HitAccum {
    per_origin: BTreeMap<MatchOrigin, BTreeSet<String>>,
}

impl HitAccum {
    fn add(&mut self, origin: MatchOrigin, term: &str) {
        self.per_origin
            .entry(origin)
            .or_default()
            .insert(term.to_string());
    }

    fn score(&self) -> f64 {
        self.per_origin
            .iter()
            .map(|(origin, terms)| origin.weight() * terms.len() as f64)
            .sum()
    }
}

/// The search engine. Built over a chain engine handle; no hidden state,
/// no isolated instances.
pub struct SearchEngine {
    chain: Arc<ChainEngine>,
}

impl SearchEngine {
    pub fn new(chain: Arc<ChainEngine>) -> Self {
        Self { chain }
    }

    pub fn search(
        &self,
        query: &SearchQuery,
        cancel: &CancelToken,
    ) -> Result<SearchResults, LedgerError> {
        if query.terms.is_empty() && query.recipient.is_none() {
            return Err(LedgerError::InvalidInput(
                "search needs at least one term or a recipient".into(),
            ));
        }
        if let Some(pw) = query.password.as_deref() {
            self.chain.limits().check_password(pw)?;
        }

        let mode = route(query.password.is_some(), query.mode, &query.hints);
        if mode == SearchMode::AuthenticatedPrivate && query.password.is_none() {
            return Err(LedgerError::Unauthorized(
                "authenticated search requires a password".into(),
            ));
        }
        if query.recipient.is_some() && query.password.is_none() {
            return Err(LedgerError::Unauthorized(
                "recipient filtering requires an authenticated query".into(),
            ));
        }

        let mut acc: BTreeMap<u64, HitAccum> = BTreeMap::new();
        let mut truncated = false;

        // ── Public layer (every strategy) ─────────────────────────────────────
        let index = self.chain.index();
        for term in &query.terms {
            for n in index.lookup_public(std::slice::from_ref(term))? {
                acc.entry(n).or_default().add(MatchOrigin::Public, term);
            }
        }

        // ── Private layer + recipient index ───────────────────────────────────
        if mode != SearchMode::FastPublic {
            if let Some(pw) = query.password.as_deref() {
                for term in &query.terms {
                    for n in index.lookup_private(std::slice::from_ref(term), pw)? {
                        acc.entry(n).or_default().add(MatchOrigin::Private, term);
                    }
                }
                if let Some(recipient) = query.recipient.as_deref() {
                    for n in index.lookup_recipient(recipient)? {
                        acc.entry(n).or_default().add(MatchOrigin::Private, recipient);
                    }
                }
            }
        }

        // ── Deep content scan ─────────────────────────────────────────────────
        if mode == SearchMode::DeepContent {
            truncated = self.deep_scan(query, cancel, &mut acc)?;
        }

        // ── Materialize: one batch fetch for every candidate block ────────────
        let numbers: Vec<u64> = acc.keys().copied().collect();
        let blocks = self.chain.dao().batch_retrieve_blocks(&numbers)?;
        debug!(candidates = numbers.len(), fetched = blocks.len(), "search materialized");

        let mut recipient_filter: Option<String> = query
            .recipient
            .as_deref()
            .map(|r| r.trim().to_lowercase());
        if recipient_filter.as_deref() == Some("") {
            recipient_filter = None;
        }

        let mut hits: Vec<SearchHit> = blocks
            .into_iter()
            .filter(|b| match &recipient_filter {
                None => true,
                Some(r) => b
                    .recipient_username
                    .as_deref()
                    .is_some_and(|br| br.to_lowercase() == *r),
            })
            .filter_map(|b| {
                let entry = acc.get(&b.block_number)?;
                let matched: BTreeSet<String> = entry
                    .per_origin
                    .values()
                    .flat_map(|terms| terms.iter().cloned())
                    .collect();
                Some(SearchHit {
                    block_number: b.block_number,
                    matched_terms: matched.into_iter().collect(),
                    origins: entry.per_origin.keys().copied().collect(),
                    score: entry.score(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.block_number.cmp(&b.block_number))
        });
        if hits.len() > query.max_results {
            hits.truncate(query.max_results);
            truncated = true;
        }

        Ok(SearchResults { hits, truncated })
    }

    /// Linear scan over on-chain data and qualifying off-chain blobs.
    /// Returns whether the scan was cut short.
    fn deep_scan(
        &self,
        query: &SearchQuery,
        cancel: &CancelToken,
        acc: &mut BTreeMap<u64, HitAccum>,
    ) -> Result<bool, LedgerError> {
        let needles: Vec<String> = query
            .terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if needles.is_empty() {
            return Ok(false);
        }
        let threshold = self.chain.limits().deep_scan_blob_threshold;

        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Ok(true);
            }
            let page = self.chain.dao().get_blocks_paginated(offset, SCAN_PAGE)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;

            for block in &page {
                self.scan_block_content(block, &needles, query.password.as_deref(), acc);
                self.scan_off_chain(block, &needles, query.password.as_deref(), threshold, acc);
            }
        }
        Ok(false)
    }

    fn scan_block_content(
        &self,
        block: &Block,
        needles: &[String],
        password: Option<&str>,
        acc: &mut BTreeMap<u64, HitAccum>,
    ) {
        let text = if block.is_encrypted {
            match password {
                Some(pw) => self.chain.try_open_block_data(block, pw),
                None => None,
            }
        } else {
            Some(block.data.clone())
        };
        let Some(text) = text else { return };
        let haystack = text.to_lowercase();
        for needle in needles {
            if haystack.contains(needle) {
                acc.entry(block.block_number)
                    .or_default()
                    .add(MatchOrigin::Content, needle);
            }
        }
    }

    fn scan_off_chain(
        &self,
        block: &Block,
        needles: &[String],
        password: Option<&str>,
        threshold: u64,
        acc: &mut BTreeMap<u64, HitAccum>,
    ) {
        let Some(reference) = &block.off_chain_ref else { return };
        if reference.size >= threshold {
            return;
        }
        if reference.iv.is_some() && password.is_none() {
            return;
        }
        let Ok(bytes) = self.chain.blobs().load(reference, password) else {
            return;
        };
        let haystack = String::from_utf8_lossy(&bytes).to_lowercase();
        for needle in needles {
            if haystack.contains(needle) {
                acc.entry(block.block_number)
                    .or_default()
                    .add(MatchOrigin::OffChain, needle);
            }
        }
    }
}
