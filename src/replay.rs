//! Block fetch, verification and replay
//!
//! Drives one received block range through
//! `Fetching -> Verifying -> RollingBackSuperseded -> Applying -> Committing`.
//! The walk runs backward from the requested block until it reaches a block
//! whose signature verifies against the local chain, which is the fork
//! point; everything at or above it is undone through the journal and the
//! fetched blocks are replayed in ascending order inside one storage
//! session. Any failure rolls the whole session back, so the ledger never
//! exposes a partially applied batch.

use crate::access::AccessEvaluator;
use crate::context::{BlockContext, TransactionContext};
use crate::engine::{
    bind_wire_params, ContractEngine, SignatureVerifier, CALL_ACTION, CALL_CONDITIONS, CALL_INIT,
};
use crate::error::{ChainError, EngineError, JournalError};
use crate::fingerprint::{Digest, Fingerprinter};
use crate::journal;
use crate::logging::{record_tx_error, AuditLog};
use crate::params::ChainParams;
use crate::program::ProgramRegistry;
use crate::storage::{
    Assignment, Delete, Insert, Select, Statement, StorageSession, Update, Value,
};
use crate::wire::{parse_block, BlockHeader, ParsedTransaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Networking collaborator: fetch one block body from a peer. Synchronous
/// request/response; timeouts are the implementation's business and surface
/// as fetch errors with no state change.
pub trait BlockFetcher: Send + Sync {
    fn block_body(&self, host: &str, block_id: i64) -> Result<Vec<u8>, EngineError>;
}

/// Opens storage sessions for the controller
pub trait SessionFactory {
    fn begin<'a>(&'a mut self) -> Box<dyn StorageSession + 'a>;
}

impl SessionFactory for crate::memstore::MemoryStorage {
    fn begin<'a>(&'a mut self) -> Box<dyn StorageSession + 'a> {
        Box::new(self.session())
    }
}

struct FetchedBlock {
    header: BlockHeader,
    tx_bodies: Vec<Vec<u8>>,
    merkle_root: Vec<u8>,
    raw: Vec<u8>,
}

/// Failure details carried out of an aborted apply so the status record can
/// be written after the session rolled back.
struct TxFailure {
    tx_hash: Vec<u8>,
    time: i64,
    ecosystem_id: i64,
    key_id: i64,
    block_id: i64,
    reason: String,
}

/// Orchestrates block replay and owns the process-wide execution context
pub struct ReplayController {
    pub params: ChainParams,
    pub registry: ProgramRegistry,
    pub evaluator: AccessEvaluator,
    pub fingerprinter: Fingerprinter,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub fetcher: Arc<dyn BlockFetcher>,
    pub audit: AuditLog,
    applying: AtomicBool,
}

impl ReplayController {
    pub fn new(
        params: ChainParams,
        registry: ProgramRegistry,
        evaluator: AccessEvaluator,
        fingerprinter: Fingerprinter,
        verifier: Arc<dyn SignatureVerifier>,
        fetcher: Arc<dyn BlockFetcher>,
    ) -> Self {
        Self {
            params,
            registry,
            evaluator,
            fingerprinter,
            verifier,
            fetcher,
            audit: AuditLog::default(),
            applying: AtomicBool::new(false),
        }
    }

    /// Fetch blocks backward from `start_block_id`, roll back the
    /// superseded range and replay the fetched range. Single writer: a
    /// concurrent call fails with a busy error instead of queueing, because
    /// rollback-id sequencing is not safe under two appliers.
    pub fn replay_from(
        &mut self,
        storage: &mut dyn SessionFactory,
        start_block_id: i64,
        host: &str,
    ) -> Result<(), EngineError> {
        if self.applying.swap(true, Ordering::SeqCst) {
            return Err(ChainError::ReplayBusy.into());
        }
        let result = self.replay_inner(storage, start_block_id, host);
        self.applying.store(false, Ordering::SeqCst);
        result
    }

    fn replay_inner(
        &mut self,
        storage: &mut dyn SessionFactory,
        start_block_id: i64,
        host: &str,
    ) -> Result<(), EngineError> {
        let blocks = self.fetch_chain(storage, start_block_id, host)?;
        let lowest = blocks
            .last()
            .map(|b| b.header.block_id)
            .unwrap_or(start_block_id);

        let failure;
        {
            let mut session = storage.begin();
            match self.apply_blocks(session.as_mut(), &blocks, lowest) {
                Ok(()) => {
                    session.commit()?;
                    return Ok(());
                }
                Err((err, failed_tx)) => {
                    session.rollback()?;
                    if err.is_fatal() {
                        return Err(err);
                    }
                    failure = (err, failed_tx);
                }
            }
        }

        // status rows survive the abort: they are written through a fresh
        // session after the batch rolled back
        let (err, failed_tx) = failure;
        if let Some(tx) = failed_tx {
            let mut session = storage.begin();
            record_tx_error(
                session.as_mut(),
                &tx.tx_hash,
                tx.time,
                tx.ecosystem_id,
                tx.key_id,
                tx.block_id,
                &tx.reason,
            )?;
            session.commit()?;
        }
        Err(err)
    }

    /// Fetching: walk backward until a block's signature verifies against
    /// the locally stored previous hash, bounded by the rollback depth and
    /// the genesis block.
    fn fetch_chain(
        &mut self,
        storage: &mut dyn SessionFactory,
        start_block_id: i64,
        host: &str,
    ) -> Result<Vec<FetchedBlock>, EngineError> {
        let session = storage.begin();
        let mut blocks = Vec::new();
        let mut current_id = start_block_id;
        let mut count = 0i64;

        loop {
            if current_id < 2 {
                return Err(ChainError::BelowGenesis.into());
            }
            if count > self.params.rollback_depth {
                return Err(ChainError::DepthExceeded {
                    depth: self.params.rollback_depth,
                }
                .into());
            }

            let raw = self.fetcher.block_body(host, current_id)?;
            let (header, tx_bodies) = parse_block(&raw)?;
            if self.params.is_bad_block(header.block_id, &header.sign) {
                return Err(ChainError::Denylisted {
                    block_id: header.block_id,
                }
                .into());
            }
            if header.block_id != current_id {
                return Err(ChainError::BlockIdMismatch {
                    header: header.block_id,
                    requested: current_id,
                }
                .into());
            }
            let node_public = self
                .params
                .node_by_position(header.node_position)?
                .public
                .clone();

            let leaves = leaf_bytes(&self.fingerprinter.tx_fingerprints(&tx_bodies)?);
            let merkle_root = self.fingerprinter.merkle_root(&leaves)?;
            let prev_hash =
                stored_block_hash(session.as_ref(), current_id - 1).unwrap_or_default();
            let message = header.for_sign(&prev_hash, &merkle_root);
            let verified = self.verifier.verify(&[node_public], &message, &header.sign)?;

            self.audit.debug(
                header.time,
                format!(
                    "fetched block {} from {} ({} txs, signature {})",
                    header.block_id,
                    host,
                    tx_bodies.len(),
                    if verified { "ok" } else { "stale" }
                ),
            );
            blocks.push(FetchedBlock {
                header,
                tx_bodies,
                merkle_root,
                raw,
            });
            count += 1;
            if verified {
                return Ok(blocks);
            }
            current_id -= 1;
        }
    }

    /// RollingBackSuperseded, Applying and Committing, all inside the
    /// caller's session. Returns the failed transaction's details alongside
    /// the error so the caller can record its status after the abort.
    #[allow(clippy::type_complexity)]
    fn apply_blocks(
        &mut self,
        session: &mut dyn StorageSession,
        blocks: &[FetchedBlock],
        lowest: i64,
    ) -> Result<(), (EngineError, Option<TxFailure>)> {
        journal::undo_block_range(session, &self.fingerprinter, lowest).map_err(|e| (e, None))?;

        let mut prev_hash = stored_block_hash(session, lowest - 1).unwrap_or_default();
        let mut prev_id = lowest - 1;
        let mut head: Option<(i64, Digest)> = None;

        for block in blocks.iter().rev() {
            let header = &block.header;
            if header.block_id != prev_id + 1 {
                return Err((
                    ChainError::HeaderMismatch {
                        block_id: header.block_id,
                    }
                    .into(),
                    None,
                ));
            }
            let node_public = self
                .params
                .node_by_position(header.node_position)
                .map_err(|e| (e.into(), None))?
                .public
                .clone();
            let message = header.for_sign(&prev_hash, &block.merkle_root);
            let verified = self
                .verifier
                .verify(&[node_public], &message, &header.sign)
                .map_err(|e| (e, None))?;
            if !verified {
                return Err((
                    ChainError::BadSignature {
                        block_id: header.block_id,
                    }
                    .into(),
                    None,
                ));
            }
            let hash = self
                .fingerprinter
                .double_hash(header.for_hash(&prev_hash, &block.merkle_root).as_bytes())
                .map_err(|e| (e.into(), None))?;

            self.play_block(session, block, &hash)?;

            session
                .execute(&Statement::Insert(Insert {
                    table: "blocks".to_string(),
                    columns: vec![
                        ("id".to_string(), Value::Int(header.block_id)),
                        ("hash".to_string(), Value::Bytes(hash.0.to_vec())),
                        ("data".to_string(), Value::Bytes(block.raw.clone())),
                        ("ecosystem_id".to_string(), Value::Int(header.ecosystem_id)),
                        ("key_id".to_string(), Value::Int(header.key_id)),
                        (
                            "node_position".to_string(),
                            Value::Int(header.node_position),
                        ),
                        ("time".to_string(), Value::Int(header.time)),
                        (
                            "tx_count".to_string(),
                            Value::Int(block.tx_bodies.len() as i64),
                        ),
                    ],
                }))
                .map_err(|e| (e.into(), None))?;

            prev_hash = hash.0.to_vec();
            prev_id = header.block_id;
            head = Some((header.block_id, hash));
        }

        if let Some((head_id, head_hash)) = head {
            self.commit_pointers(session, head_id, &head_hash)
                .map_err(|e| (e, None))?;
            let horizon = head_id - self.params.rollback_depth;
            if horizon > 1 {
                journal::prune_before(session, horizon).map_err(|e| (e, None))?;
            }
        }
        Ok(())
    }

    /// Apply every transaction of one block through the execution engine
    fn play_block(
        &mut self,
        session: &mut dyn StorageSession,
        block: &FetchedBlock,
        block_hash: &Digest,
    ) -> Result<(), (EngineError, Option<TxFailure>)> {
        let header = &block.header;
        let block_ctx = BlockContext {
            block_id: header.block_id,
            time: header.time,
            key_id: header.key_id,
            ecosystem_id: header.ecosystem_id,
            node_position: header.node_position,
        };

        for body in &block.tx_bodies {
            let tx_hash = self
                .fingerprinter
                .double_hash(body)
                .map_err(|e| (e.into(), None))?
                .0
                .to_vec();

            let outcome = self.play_transaction(session, body, &tx_hash, &block_ctx);
            match outcome {
                Ok(()) => {
                    session
                        .execute(&Statement::Insert(Insert {
                            table: "log_transactions".to_string(),
                            columns: vec![
                                ("hash".to_string(), Value::Bytes(tx_hash.clone())),
                                ("time".to_string(), Value::Int(header.time)),
                            ],
                        }))
                        .map_err(|e| (e.into(), None))?;
                }
                Err((err, failure)) => {
                    self.audit.error(
                        header.time,
                        format!(
                            "block {} ({}): transaction {} failed: {}",
                            header.block_id,
                            block_hash,
                            hex::encode(&tx_hash),
                            err
                        ),
                    );
                    if journal::undo_transaction(session, &tx_hash).is_err() {
                        return Err((
                            JournalError::RollbackFailed {
                                reason: format!(
                                    "transaction {} could not be reverted",
                                    hex::encode(&tx_hash)
                                ),
                            }
                            .into(),
                            None,
                        ));
                    }
                    return Err((err, failure));
                }
            }
        }
        Ok(())
    }

    fn play_transaction(
        &mut self,
        session: &mut dyn StorageSession,
        body: &[u8],
        tx_hash: &[u8],
        block_ctx: &BlockContext,
    ) -> Result<(), (EngineError, Option<TxFailure>)> {
        let duplicate = session
            .query_row(
                &Select::all("log_transactions").filter("hash", Value::Bytes(tx_hash.to_vec())),
            )
            .map_err(|e| (e.into(), None))?;
        if duplicate.is_some() {
            let err: EngineError = ChainError::DuplicateTransaction {
                hash: hex::encode(tx_hash),
            }
            .into();
            let failure = TxFailure {
                tx_hash: tx_hash.to_vec(),
                time: block_ctx.time,
                ecosystem_id: 0,
                key_id: 0,
                block_id: block_ctx.block_id,
                reason: err.to_string(),
            };
            return Err((err, Some(failure)));
        }

        let tx = ParsedTransaction::parse(body).map_err(|e| (e.into(), None))?;
        let fail = |err: EngineError| {
            let failure = TxFailure {
                tx_hash: tx_hash.to_vec(),
                time: tx.time,
                ecosystem_id: tx.ecosystem_id,
                key_id: tx.key_id,
                block_id: block_ctx.block_id,
                reason: err.to_string(),
            };
            (err, Some(failure))
        };

        let engine = ContractEngine {
            registry: &self.registry,
            params: &self.params,
            evaluator: &self.evaluator,
            verifier: self.verifier.as_ref(),
        };
        let program = engine
            .resolve(&tx.contract, tx.ecosystem_id, false)
            .map_err(&fail)?;
        let params = bind_wire_params(&program, &tx.raw_params).map_err(&fail)?;

        let mut ctx = TransactionContext::builder()
            .with_tx_hash(tx_hash.to_vec())
            .with_tx_type(tx.tx_type as i64)
            .with_time(tx.time)
            .with_key_id(tx.key_id)
            .with_ecosystem(tx.ecosystem_id)
            .with_token_ecosystem(tx.token_ecosystem)
            .with_payload_len(body.len())
            .with_public_key(tx.public_key.clone())
            .with_signature(tx.signature.clone())
            .with_block(block_ctx.clone())
            .build();
        ctx.params = params;
        if tx.max_fuel > 0 {
            ctx.fuel_override = Some(tx.max_fuel);
        }
        ctx.init_fuel(session, &self.params);

        engine
            .call_contract(&mut ctx, session, &program, CALL_INIT | CALL_CONDITIONS | CALL_ACTION)
            .map_err(&fail)?;

        self.audit.info(
            tx.time,
            format!(
                "applied {} for key {} in block {} (fuel {})",
                tx.contract, tx.key_id, block_ctx.block_id, ctx.used_cost
            ),
        );
        Ok(())
    }

    /// Committing: refresh the current-block pointer and force queued
    /// transactions to re-validate against the new head.
    fn commit_pointers(
        &mut self,
        session: &mut dyn StorageSession,
        head_id: i64,
        head_hash: &Digest,
    ) -> Result<(), EngineError> {
        session.execute(&Statement::Delete(Delete {
            table: "info_block".to_string(),
            filters: Vec::new(),
        }))?;
        session.execute(&Statement::Insert(Insert {
            table: "info_block".to_string(),
            columns: vec![
                ("block_id".to_string(), Value::Int(head_id)),
                ("hash".to_string(), Value::Bytes(head_hash.0.to_vec())),
            ],
        }))?;
        session.execute(&Statement::Update(Update {
            table: "transactions".to_string(),
            assignments: vec![Assignment::set("verified", Value::Int(0))],
            filters: vec![
                ("verified".to_string(), Value::Int(1)),
                ("used".to_string(), Value::Int(0)),
            ],
        }))?;
        Ok(())
    }
}

fn leaf_bytes(digests: &[Digest]) -> Vec<Vec<u8>> {
    digests.iter().map(|d| d.0.to_vec()).collect()
}

fn stored_block_hash(session: &dyn StorageSession, block_id: i64) -> Option<Vec<u8>> {
    session
        .query_row(&Select::all("blocks").filter("id", Value::Int(block_id)))
        .ok()
        .flatten()
        .and_then(|row| row.get("hash").and_then(Value::as_bytes).map(<[u8]>::to_vec))
}
