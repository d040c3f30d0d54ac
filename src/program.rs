//! Compiled contract programs and the program registry

use crate::engine::Environment;
use crate::error::{ContractError, EngineError};
use crate::logging::AuditLog;
use crate::storage::{Select, StorageSession, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Lifecycle phases of a contract invocation, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Conditions,
    Action,
    Rollback,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Init, Phase::Conditions, Phase::Action, Phase::Rollback];

    pub fn index(self) -> usize {
        match self {
            Phase::Init => 0,
            Phase::Conditions => 1,
            Phase::Action => 2,
            Phase::Rollback => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Conditions => "conditions",
            Phase::Action => "action",
            Phase::Rollback => "rollback",
        }
    }
}

/// Executable sub-program handle produced by the external compiler
pub type PhaseCode =
    Arc<dyn Fn(&mut Environment<'_>) -> Result<Value, EngineError> + Send + Sync>;

/// Fixed table of optional sub-programs, one slot per phase
#[derive(Clone, Default)]
pub struct PhaseTable {
    slots: [Option<PhaseCode>; 4],
}

impl PhaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, phase: Phase, code: PhaseCode) {
        self.slots[phase.index()] = Some(code);
    }

    pub fn with(mut self, phase: Phase, code: PhaseCode) -> Self {
        self.set(phase, code);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<&PhaseCode> {
        self.slots[phase.index()].as_ref()
    }
}

impl fmt::Debug for PhaseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present: Vec<&str> = Phase::ALL
            .iter()
            .filter(|phase| self.get(**phase).is_some())
            .map(|phase| phase.name())
            .collect();
        f.debug_struct("PhaseTable").field("present", &present).finish()
    }
}

/// Declared parameter types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Money,
    Text,
    Bytes,
}

/// Validation tags attached to a declared parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamTags {
    pub optional: bool,
    pub address: bool,
    pub signature: bool,
}

/// One declared parameter of a contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub tags: ParamTags,
}

impl ParamSpec {
    pub fn new(name: &str, ty: ParamType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            tags: ParamTags::default(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.tags.optional = true;
        self
    }

    pub fn address(mut self) -> Self {
        self.tags.address = true;
        self
    }

    pub fn signature(mut self) -> Self {
        self.tags.signature = true;
        self
    }
}

/// Ownership metadata of a compiled contract
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramOwner {
    pub account_id: i64,
    pub token_ecosystem: i64,
    /// Pre-approved to bill its owner account for fuel
    pub active: bool,
    /// Source-table row the program was compiled from
    pub row_id: i64,
}

/// Immutable compiled representation of one contract
#[derive(Clone)]
pub struct ContractProgram {
    pub name: String,
    pub ecosystem_id: i64,
    /// Lives in a virtual dedicated ecosystem's private registry
    pub dedicated: bool,
    pub owner: ProgramOwner,
    pub schema: Vec<ParamSpec>,
    pub phases: PhaseTable,
    pub price: Option<PhaseCode>,
    /// Names of contracts this one calls
    pub used: Vec<String>,
}

impl ContractProgram {
    pub fn new(name: &str, ecosystem_id: i64) -> Self {
        Self {
            name: name.to_string(),
            ecosystem_id,
            dedicated: false,
            owner: ProgramOwner::default(),
            schema: Vec::new(),
            phases: PhaseTable::new(),
            price: None,
            used: Vec::new(),
        }
    }
}

impl fmt::Debug for ContractProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractProgram")
            .field("name", &self.name)
            .field("ecosystem_id", &self.ecosystem_id)
            .field("dedicated", &self.dedicated)
            .field("owner", &self.owner)
            .field("schema", &self.schema)
            .field("phases", &self.phases)
            .field("has_price", &self.price.is_some())
            .field("used", &self.used)
            .finish()
    }
}

/// Compiler collaborator: turns contract source into compiled programs.
/// One source text may define several contracts.
pub trait ContractCompiler: Send + Sync {
    fn compile(
        &self,
        source: &str,
        ecosystem_id: i64,
        owner: &ProgramOwner,
    ) -> Result<Vec<ContractProgram>, EngineError>;
}

/// Registry of compiled programs
///
/// The main namespace is keyed by (ecosystem, name). Every virtual
/// dedicated ecosystem has its own fully separate registry; resolution
/// never falls through from one to the other. The registry is owned by the
/// replay controller's process context and passed by reference into the
/// execution engine.
#[derive(Default)]
pub struct ProgramRegistry {
    main: HashMap<(i64, String), Arc<ContractProgram>>,
    dedicated: HashMap<i64, HashMap<String, Arc<ContractProgram>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a program under its scoped name
    pub fn publish(&mut self, program: ContractProgram) {
        let eco = program.ecosystem_id;
        let name = program.name.clone();
        if program.dedicated {
            self.dedicated
                .entry(eco)
                .or_default()
                .insert(name, Arc::new(program));
        } else {
            self.main.insert((eco, name), Arc::new(program));
        }
    }

    /// Look a program up by scoped name
    pub fn resolve(
        &self,
        name: &str,
        ecosystem_id: i64,
        dedicated: bool,
    ) -> Result<Arc<ContractProgram>, ContractError> {
        let found = if dedicated {
            self.dedicated
                .get(&ecosystem_id)
                .and_then(|registry| registry.get(name))
        } else {
            self.main.get(&(ecosystem_id, name.to_string()))
        };
        found.cloned().ok_or_else(|| ContractError::NotFound {
            name: name.to_string(),
            ecosystem_id,
        })
    }

    pub fn contains(&self, name: &str, ecosystem_id: i64, dedicated: bool) -> bool {
        self.resolve(name, ecosystem_id, dedicated).is_ok()
    }

    /// Flip the active flag of the main-registry program compiled from the
    /// given source row. Contracts are deactivated, never deleted.
    pub fn set_active(&mut self, ecosystem_id: i64, row_id: i64, active: bool) {
        for ((eco, _), program) in self.main.iter_mut() {
            if *eco == ecosystem_id && program.owner.row_id == row_id {
                let mut updated = (**program).clone();
                updated.owner.active = active;
                *program = Arc::new(updated);
            }
        }
    }

    /// Contracts called from `name`, optionally transitively
    pub fn used_contracts(&self, name: &str, ecosystem_id: i64, full: bool) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = match self.resolve(name, ecosystem_id, false) {
            Ok(program) => program.used.clone(),
            Err(_) => return out,
        };
        while let Some(next) = queue.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            out.push(next.clone());
            if full {
                if let Ok(program) = self.resolve(&next, ecosystem_id, false) {
                    queue.extend(program.used.iter().cloned());
                }
            }
        }
        out
    }

    /// Compile and publish every stored contract of every ecosystem, in
    /// source-row order. A row that fails to compile is skipped with an
    /// audit entry; the rest of the load continues.
    pub fn load_programs(
        &mut self,
        session: &dyn StorageSession,
        compiler: &dyn ContractCompiler,
        audit: &mut AuditLog,
    ) -> Result<usize, EngineError> {
        let mut loaded = 0;
        let ecosystems = session.query_all(&Select::all("ecosystems"))?;
        for row in &ecosystems {
            let eco = row.get("id").and_then(Value::as_int).unwrap_or(0);
            if eco == 0 {
                continue;
            }
            loaded += self.load_table(session, compiler, audit, eco, false)?;
            loaded += self.load_table(session, compiler, audit, eco, true)?;
        }
        Ok(loaded)
    }

    fn load_table(
        &mut self,
        session: &dyn StorageSession,
        compiler: &dyn ContractCompiler,
        audit: &mut AuditLog,
        eco: i64,
        dedicated: bool,
    ) -> Result<usize, EngineError> {
        let table = if dedicated {
            format!("{}_dedicated_contracts", eco)
        } else {
            format!("{}_contracts", eco)
        };
        if !session.has_table(&table) {
            return Ok(0);
        }
        let mut rows = session.query_all(&Select::all(&table))?;
        rows.sort_by_key(|row| row.get("id").and_then(Value::as_int).unwrap_or(0));

        let mut loaded = 0;
        for row in rows {
            let row_id = row.get("id").and_then(Value::as_int).unwrap_or(0);
            let source = row
                .get("value")
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string();
            let owner = ProgramOwner {
                account_id: row.get("wallet_id").and_then(Value::as_int).unwrap_or(0),
                token_ecosystem: row.get("token_id").and_then(Value::as_int).unwrap_or(0),
                active: row.get("active").and_then(Value::as_int).unwrap_or(0) == 1,
                row_id,
            };
            match compiler.compile(&source, eco, &owner) {
                Ok(programs) => {
                    for mut program in programs {
                        program.ecosystem_id = eco;
                        program.dedicated = dedicated;
                        program.owner = owner.clone();
                        self.publish(program);
                        loaded += 1;
                    }
                }
                Err(err) => {
                    audit.error(
                        0,
                        format!("contract row {} in {} failed to compile: {}", row_id, table, err),
                    );
                }
            }
        }
        Ok(loaded)
    }
}
