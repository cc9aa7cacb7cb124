use veilchain_core::Block;

/// Dominant status of one validated block. The aspects are also exposed as
/// independent flags on [`BlockValidation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    Valid,
    /// Missing or malformed fields, broken linkage, or an encrypted block
    /// whose stored data lost its envelope shape.
    StructurallyInvalid,
    /// Recomputed hash or signature check failed.
    HashMismatch,
    /// Signer unknown or outside its authorization interval.
    AuthorizationInvalid,
    /// Referenced off-chain blob missing or failing integrity checks.
    OffChainMissing,
}

/// Result of validating one block; each aspect is flagged independently.
#[derive(Clone, Debug)]
pub struct BlockValidation {
    pub block_number: u64,
    pub structural_ok: bool,
    pub hash_ok: bool,
    pub signature_ok: bool,
    pub authorization_ok: bool,
    pub off_chain_ok: bool,
    pub detail: Option<String>,
}

impl BlockValidation {
    pub fn status(&self) -> BlockStatus {
        if !self.structural_ok {
            BlockStatus::StructurallyInvalid
        } else if !self.hash_ok || !self.signature_ok {
            BlockStatus::HashMismatch
        } else if !self.authorization_ok {
            BlockStatus::AuthorizationInvalid
        } else if !self.off_chain_ok {
            BlockStatus::OffChainMissing
        } else {
            BlockStatus::Valid
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status() == BlockStatus::Valid
    }
}

/// Whole-chain validation report. One bad block never stops the others
/// from being checked.
#[derive(Debug, Default)]
pub struct ChainReport {
    pub results: Vec<BlockValidation>,
}

impl ChainReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn valid_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_valid()).count()
    }

    pub fn is_valid(&self) -> bool {
        self.valid_count() == self.total()
    }

    pub fn invalid_blocks(&self) -> impl Iterator<Item = &BlockValidation> {
        self.results.iter().filter(|r| !r.is_valid())
    }

    /// Validation for a particular block, if it was covered by the run.
    pub fn for_block(&self, block_number: u64) -> Option<&BlockValidation> {
        self.results.iter().find(|r| r.block_number == block_number)
    }

    pub fn summary(&self) -> String {
        format!("{}/{} blocks valid", self.valid_count(), self.total())
    }
}

/// Structural checks that need no store access. Linkage against the
/// previous block is included when the caller supplies it.
pub(crate) fn structural_check(block: &Block, prev: Option<&Block>) -> (bool, Option<String>) {
    let fail = |msg: String| (false, Some(msg));

    if block.hash.len() != 64 || !block.hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return fail(format!("malformed hash field: {:?}", block.hash));
    }
    if block.signature.is_empty() {
        return fail("empty signature".into());
    }
    if block.signer_public_key.is_empty() {
        return fail("empty signer public key".into());
    }
    if block.data.is_empty() && block.off_chain_ref.is_none() {
        return fail("empty data with no off-chain reference".into());
    }

    if block.block_number == 0 {
        if block.previous_hash != veilchain_core::constants::GENESIS_PREVIOUS_HASH {
            return fail("genesis block must use the sentinel previous hash".into());
        }
    } else if let Some(prev) = prev {
        if block.previous_hash != prev.hash {
            return fail(format!(
                "previous_hash does not match hash of block {}",
                prev.block_number
            ));
        }
        if block.block_number != prev.block_number + 1 {
            return fail("non-contiguous block number".into());
        }
    }

    if block.is_encrypted {
        if !block.has_encrypted_marker() {
            return fail("encrypted block lost its envelope marker".into());
        }
        if block.encryption_metadata.is_none() {
            return fail("encrypted block without encryption metadata".into());
        }
    }

    (true, None)
}
