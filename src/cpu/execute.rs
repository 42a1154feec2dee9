//! CPU execution engine.
//!
//! Every tick the CPU drains its lanes, reassembles groups and sorts them
//! into three tables: address reports from memory (fetched strictly in key
//! order), instruction groups (decoded strictly in key order) and data
//! responses. At most one fetch per program slot is in flight, so a group
//! coming back under a key nobody asked for means its slot was overwritten. Decoded actions become tasks. A task first makes sure every
//! memory word it reads is available, and only then runs, so a task parked
//! on a pending read is retried later without side effects.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::asm::disasm::format_action;
use crate::bus::{BusError, Port};
use crate::clock;
use crate::cpu::cache::WriteBackCache;
use crate::cpu::loops::{Conditional, Loop, LoopId, LoopState};
use crate::cpu::Registers;
use crate::isa::fragment::MEMORY_CHANNEL;
use crate::isa::{
    Action, DecodeError, Decoder, EncodeError, Encoder, Fragment, FragmentType, Key, Opcode,
    Origin, ParamType, Parameter, Reassembler, ReassemblyError, Signal, TRANSACTION_KEY_BASE,
};
use crate::word::WordLength;

/// Upper bound on tasks completed in a single tick.
pub const MAX_STEPS_PER_TICK: usize = 256;

/// Executed actions kept for display.
const HISTORY_LEN: usize = 16;

/// How memory operands are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Straight to memory; writes go through.
    Direct,
    /// Through the write-back cache.
    Loop,
}

#[derive(Debug, Clone)]
enum Task {
    /// Fresh from the wire, interpreted against the loop state.
    Decoded(Action),
    /// A recorded loop instruction.
    Replay(Action),
    /// Evaluate a comparison and queue the chosen branch.
    Resolve { owner: Option<LoopId>, branch: Conditional },
    /// The chosen branch of a conditional.
    Branch(Action),
    /// End of a replay with no trailing conditional.
    Finish(LoopId),
}

enum Progress {
    Done,
    Blocked,
}

/// The CPU core.
pub struct Cpu {
    port: Port,
    word: WordLength,
    decoder: Decoder,
    encoder: Encoder,
    reassembler: Reassembler,
    registers: Registers,
    cache: WriteBackCache,
    loops: BTreeMap<LoopId, Loop>,
    state: LoopState,
    /// Program slots reported by memory, by instruction key.
    reports: BTreeMap<Key, i64>,
    /// Fetches in flight: instruction key to program slot.
    fetching: BTreeMap<Key, i64>,
    /// Instruction groups that answered no outstanding fetch.
    strays: BTreeMap<Key, Vec<Fragment>>,
    /// Instruction groups by instruction key.
    instructions: BTreeMap<Key, Vec<Fragment>>,
    next_fetch: Key,
    execution_index: Key,
    tasks: VecDeque<Task>,
    /// Data words read for the task at the head of the queue.
    fetched: HashMap<i64, i64>,
    outstanding: HashSet<i64>,
    next_transaction: Key,
    data_len: usize,
    executed: u64,
    ticks: u64,
    history: VecDeque<Action>,
}

impl Cpu {
    /// Create a CPU on `port` with zeroed registers.
    ///
    /// `data_len` is the number of data addresses the memory unit serves.
    pub fn new(port: Port, registers: &[String], word: WordLength, data_len: usize) -> Self {
        Self {
            port,
            word,
            decoder: Decoder::new(word),
            encoder: Encoder::new(registers, word),
            reassembler: Reassembler::new(),
            registers: Registers::new(registers, word),
            cache: WriteBackCache::new(),
            loops: BTreeMap::new(),
            state: LoopState::Idle,
            reports: BTreeMap::new(),
            fetching: BTreeMap::new(),
            strays: BTreeMap::new(),
            instructions: BTreeMap::new(),
            next_fetch: 0,
            execution_index: 0,
            tasks: VecDeque::new(),
            fetched: HashMap::new(),
            outstanding: HashSet::new(),
            next_transaction: TRANSACTION_KEY_BASE,
            data_len,
            executed: 0,
            ticks: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn cache(&self) -> &WriteBackCache {
        &self.cache
    }

    pub fn loop_state(&self) -> &LoopState {
        &self.state
    }

    pub fn loops(&self) -> &BTreeMap<LoopId, Loop> {
        &self.loops
    }

    /// Most recently executed actions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Action> {
        self.history.iter()
    }

    /// Number of arithmetic actions executed.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn word(&self) -> WordLength {
        self.word
    }

    /// Nothing buffered, queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
            && self.reports.is_empty()
            && self.fetching.is_empty()
            && self.strays.is_empty()
            && self.instructions.is_empty()
            && self.outstanding.is_empty()
            && self.reassembler.is_empty()
            && !self.port.has_waiting()
    }

    // ==== Tick ====

    /// One CPU cycle. Returns the number of tasks completed.
    pub fn tick(&mut self) -> Result<usize, CpuError> {
        self.ticks += 1;

        let fragments = self.port.drain();
        for group in self.reassembler.extend(fragments)? {
            self.route(group)?;
        }

        self.check_strays()?;

        while let Some(&slot) = self.reports.get(&self.next_fetch) {
            if self.fetching.values().any(|&s| s == slot) {
                break;
            }
            self.reports.remove(&self.next_fetch);
            log::trace!("cpu: fetch instruction {} from slot {}", self.next_fetch, slot);
            self.transact(Signal::Read, &[(FragmentType::Call, slot)])?;
            self.fetching.insert(self.next_fetch, slot);
            self.next_fetch += 1;
        }

        while let Some(group) = self.instructions.remove(&self.execution_index) {
            let action = self.decoder.decode(&group)?;
            self.tasks.push_back(Task::Decoded(action));
            self.execution_index += 1;
        }

        let mut steps = 0;
        while steps < MAX_STEPS_PER_TICK {
            let Some(task) = self.tasks.pop_front() else {
                break;
            };
            match self.run_task(&task)? {
                Progress::Done => {
                    self.fetched.clear();
                    steps += 1;
                }
                Progress::Blocked => {
                    self.tasks.push_front(task);
                    break;
                }
            }
        }
        Ok(steps)
    }

    /// Start the tick loop on its own thread.
    pub fn run(self, period: Duration, stop: Arc<AtomicBool>) -> JoinHandle<Result<Cpu, CpuError>> {
        clock::spawn_ticker("cpu", self, period, stop, Cpu::tick)
    }

    fn route(&mut self, group: Vec<Fragment>) -> Result<(), CpuError> {
        let head = group[0];
        match (head.signal, head.kind) {
            (Signal::Read, _) => match self.decoder.words(&group)?.as_slice() {
                [(FragmentType::Memory, slot)] => {
                    self.reports.insert(head.key, *slot);
                }
                _ => return Err(CpuError::MalformedResponse(head.key)),
            },
            (Signal::Write, FragmentType::Call) => {
                if self.fetching.remove(&head.key).is_some() {
                    self.instructions.insert(head.key, group);
                } else {
                    self.strays.insert(head.key, group);
                }
            }
            (Signal::Write, FragmentType::Memory) => match self.decoder.words(&group)?.as_slice() {
                [(FragmentType::Memory, address), (FragmentType::Literal, value)] => {
                    self.outstanding.remove(address);
                    self.fetched.insert(*address, *value);
                }
                _ => return Err(CpuError::MalformedResponse(head.key)),
            },
            (signal, kind) => {
                return Err(CpuError::UnexpectedGroup { key: head.key, signal, kind });
            }
        }
        Ok(())
    }

    /// Fail on a stray group once its slot is known.
    fn check_strays(&self) -> Result<(), CpuError> {
        for &found in self.strays.keys() {
            let Some(&slot) = self.reports.get(&found) else {
                continue;
            };
            return match self.fetching.iter().find(|&(_, &s)| s == slot) {
                Some((&expected, _)) => Err(CpuError::SlotOverwritten { slot, expected, found }),
                None => Err(CpuError::UnexpectedGroup { key: found, signal: Signal::Write, kind: FragmentType::Call }),
            };
        }
        Ok(())
    }

    fn run_task(&mut self, task: &Task) -> Result<Progress, CpuError> {
        match task {
            Task::Decoded(action) => self.admit(action),
            Task::Branch(action) => {
                log::debug!("cpu: branch taken: {}", self.describe(action));
                self.admit(action)
            }
            Task::Replay(action) => {
                if !self.prefetch(&reads(action), Mode::Loop)? {
                    return Ok(Progress::Blocked);
                }
                for (address, value) in self.cache.lfu_pass() {
                    log::debug!("cpu: lfu write-back 0x{:x} = {}", address, value);
                    self.write_back(address, value)?;
                }
                self.execute(action, Mode::Loop)?;
                Ok(Progress::Done)
            }
            Task::Resolve { owner, branch } => {
                let mode = if owner.is_some() { Mode::Loop } else { Mode::Direct };
                if !self.prefetch(&reads(&branch.condition), mode)? {
                    return Ok(Progress::Blocked);
                }
                let taken = self.evaluate(&branch.condition, mode)?;
                let next = if taken { &branch.if_true } else { &branch.if_false };
                self.set_state(LoopState::Idle);
                self.tasks.push_front(Task::Branch(next.clone()));
                Ok(Progress::Done)
            }
            Task::Finish(id) => {
                log::debug!("cpu: loop {} has no exit condition", id);
                self.set_state(LoopState::Idle);
                Ok(Progress::Done)
            }
        }
    }

    // ==== Loop state machine ====

    fn admit(&mut self, action: &Action) -> Result<Progress, CpuError> {
        check_shape(action)?;

        if let LoopState::AwaitingBranch { owner, condition, if_true } = &self.state {
            if action.opcode.is_comparison() {
                return Err(CpuError::ComparisonAsBranch(action.key));
            }
            let (owner, condition) = (*owner, condition.clone());
            match if_true.clone() {
                None => {
                    self.state = LoopState::AwaitingBranch { owner, condition, if_true: Some(action.clone()) };
                }
                Some(if_true) => {
                    let branch = Conditional { condition, if_true, if_false: action.clone() };
                    if let Some(id) = owner {
                        self.loops.entry(id).or_default().exit = Some(branch.clone());
                    }
                    self.set_state(LoopState::Idle);
                    self.tasks.push_front(Task::Resolve { owner, branch });
                }
            }
            return Ok(Progress::Done);
        }

        let mode = if self.state.in_loop() { Mode::Loop } else { Mode::Direct };
        match action.opcode {
            Opcode::Eq | Opcode::Gt | Opcode::Lt | Opcode::GtEq | Opcode::LtEq => {
                let owner = match self.state {
                    LoopState::Building(id) => Some(id),
                    _ => None,
                };
                self.set_state(LoopState::AwaitingBranch { owner, condition: action.clone(), if_true: None });
            }
            Opcode::Label => {
                if let LoopState::Building(building) = self.state {
                    return Err(CpuError::NestedLoop(building));
                }
                if !self.prefetch(&reads(action), mode)? {
                    return Ok(Progress::Blocked);
                }
                let id = self.loop_id(action, mode)?;
                self.loops.insert(id, Loop::default());
                self.set_state(LoopState::Building(id));
            }
            Opcode::Jump => {
                if !self.prefetch(&reads(action), mode)? {
                    return Ok(Progress::Blocked);
                }
                let id = self.loop_id(action, mode)?;
                self.jump(id)?;
            }
            Opcode::Null => self.null()?,
            Opcode::Add | Opcode::Mov | Opcode::Inc | Opcode::Imul => {
                if !self.prefetch(&reads(action), mode)? {
                    return Ok(Progress::Blocked);
                }
                self.execute(action, mode)?;
                if let LoopState::Building(id) = self.state {
                    self.loops.entry(id).or_default().instructions.push(action.clone());
                }
            }
        }
        Ok(Progress::Done)
    }

    /// Queue one replay of loop `id`, followed by its conditional.
    fn jump(&mut self, id: LoopId) -> Result<(), CpuError> {
        let body = self.loops.get(&id).ok_or(CpuError::UnknownLoop(id))?;

        let mut replay: Vec<Task> = body.instructions.iter().cloned().map(Task::Replay).collect();
        replay.push(match &body.exit {
            Some(branch) => Task::Resolve { owner: Some(id), branch: branch.clone() },
            None => Task::Finish(id),
        });

        self.set_state(LoopState::Executing(id));
        for task in replay.into_iter().rev() {
            self.tasks.push_front(task);
        }
        Ok(())
    }

    /// Leave any loop and write the whole cache back.
    fn null(&mut self) -> Result<(), CpuError> {
        self.set_state(LoopState::Idle);
        let dirty = self.cache.flush_all();
        if !dirty.is_empty() {
            log::debug!("cpu: flushing {} cache entries", dirty.len());
        }
        for (address, value) in dirty {
            self.write_back(address, value)?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            log::debug!("cpu: {} -> {}", self.state, state);
        }
        self.state = state;
    }

    fn loop_id(&mut self, action: &Action, mode: Mode) -> Result<LoopId, CpuError> {
        match &action.location {
            Some(label) => self.operand(label, mode),
            None => Err(CpuError::OperandCount { key: action.key, opcode: action.opcode, expected: 1, found: 0 }),
        }
    }

    // ==== Execution ====

    fn execute(&mut self, action: &Action, mode: Mode) -> Result<(), CpuError> {
        let destination = action.location.ok_or(CpuError::OperandCount {
            key: action.key,
            opcode: action.opcode,
            expected: 1,
            found: 0,
        })?;
        let params = &action.parameters;

        let value = match action.opcode {
            Opcode::Mov => self.operand(&params[0], mode)?,
            Opcode::Add => {
                let current = self.current(&destination)?;
                current.wrapping_add(self.operand(&params[0], mode)?)
            }
            Opcode::Inc => self.current(&destination)?.wrapping_add(1),
            Opcode::Imul => {
                let left = self.operand(&params[0], mode)?;
                let right = self.operand(&params[1], mode)?;
                left.wrapping_mul(right)
            }
            other => return Err(CpuError::NotExecutable { key: action.key, opcode: other }),
        };
        self.store(&destination, self.word.wrap(value), mode)?;

        log::debug!("cpu: [{:?}] {}", mode, self.describe(action));
        self.executed += 1;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(action.clone());
        Ok(())
    }

    fn evaluate(&mut self, condition: &Action, mode: Mode) -> Result<bool, CpuError> {
        let left = match &condition.location {
            Some(p) => self.operand(p, mode)?,
            None => return Err(CpuError::NotExecutable { key: condition.key, opcode: condition.opcode }),
        };
        let right = self.operand(&condition.parameters[0], mode)?;
        let taken = condition
            .opcode
            .compare(left, right)
            .ok_or(CpuError::NotExecutable { key: condition.key, opcode: condition.opcode })?;
        log::debug!("cpu: {} {} {} is {}", left, condition.opcode, right, taken);
        Ok(taken)
    }

    /// Resolve an operand's value. In loop mode a memory read counts as a
    /// cache touch.
    fn operand(&mut self, param: &Parameter, mode: Mode) -> Result<i64, CpuError> {
        match param.kind {
            ParamType::Register => self.registers.get(param.value),
            ParamType::Literal => Ok(param.value),
            ParamType::Memory => match mode {
                Mode::Loop => self.cache.touch(param.value).ok_or(CpuError::Unresolved(param.value)),
                Mode::Direct => self.peek(param.value),
            },
            ParamType::Call => Err(CpuError::InvalidOperand(param.value)),
        }
    }

    /// Destination's value before an update, without a touch.
    fn current(&self, destination: &Parameter) -> Result<i64, CpuError> {
        match destination.kind {
            ParamType::Register => self.registers.get(destination.value),
            ParamType::Memory => self.peek(destination.value),
            ParamType::Literal => Err(CpuError::LiteralDestination(destination.value)),
            ParamType::Call => Err(CpuError::InvalidOperand(destination.value)),
        }
    }

    fn store(&mut self, destination: &Parameter, value: i64, mode: Mode) -> Result<(), CpuError> {
        match destination.kind {
            ParamType::Register => self.registers.set(destination.value, value),
            ParamType::Memory => {
                let address = destination.value;
                self.check_address(address)?;
                match mode {
                    Mode::Loop => {
                        self.cache.store(address, value);
                        Ok(())
                    }
                    Mode::Direct => {
                        self.cache.remove(address);
                        self.write_back(address, value)
                    }
                }
            }
            ParamType::Literal => Err(CpuError::LiteralDestination(destination.value)),
            ParamType::Call => Err(CpuError::InvalidOperand(destination.value)),
        }
    }

    fn peek(&self, address: i64) -> Result<i64, CpuError> {
        self.cache
            .get(address)
            .or_else(|| self.fetched.get(&address).copied())
            .ok_or(CpuError::Unresolved(address))
    }

    // ==== Memory transactions ====

    /// Make every address in `addresses` readable, requesting what is
    /// missing. Returns whether all of them are available now.
    fn prefetch(&mut self, addresses: &[i64], mode: Mode) -> Result<bool, CpuError> {
        let mut ready = true;
        for &address in addresses {
            self.check_address(address)?;
            if self.cache.contains(address) {
                continue;
            }
            if let Some(&value) = self.fetched.get(&address) {
                if mode == Mode::Loop {
                    self.cache.seed(address, value);
                }
                continue;
            }
            ready = false;
            if self.outstanding.insert(address) {
                self.transact(Signal::Read, &[(FragmentType::Memory, address)])?;
            }
        }
        Ok(ready)
    }

    fn write_back(&mut self, address: i64, value: i64) -> Result<(), CpuError> {
        self.transact(Signal::Write, &[(FragmentType::Memory, address), (FragmentType::Literal, value)])?;
        Ok(())
    }

    fn transact(&mut self, signal: Signal, words: &[(FragmentType, i64)]) -> Result<Key, CpuError> {
        let key = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        let group = self.encoder.encode_words(key, signal, Origin::Cpu, words)?;
        self.port.send_to(MEMORY_CHANNEL, Origin::Cpu, signal, group)?;
        Ok(key)
    }

    fn check_address(&self, address: i64) -> Result<(), CpuError> {
        if address < 0 || address >= self.data_len as i64 {
            return Err(CpuError::AddressOutOfRange { address, limit: self.data_len });
        }
        Ok(())
    }

    fn describe(&self, action: &Action) -> String {
        format_action(action, self.registers.names())
    }
}

/// Memory addresses an action reads before it can run.
fn reads(action: &Action) -> Vec<i64> {
    let memory = |p: &Parameter| (p.kind == ParamType::Memory).then_some(p.value);
    match action.opcode {
        Opcode::Mov | Opcode::Imul => action.parameters.iter().filter_map(memory).collect(),
        Opcode::Null => Vec::new(),
        _ => action.operands().filter_map(memory).collect(),
    }
}

/// Reject actions whose operands cannot be executed.
fn check_shape(action: &Action) -> Result<(), CpuError> {
    let expected = match action.opcode {
        Opcode::Null => 0,
        Opcode::Inc | Opcode::Label | Opcode::Jump => 1,
        Opcode::Mov | Opcode::Add => 2,
        Opcode::Imul => 3,
        Opcode::Eq | Opcode::Gt | Opcode::Lt | Opcode::GtEq | Opcode::LtEq => 2,
    };
    let found = action.operands().count();
    if found != expected {
        return Err(CpuError::OperandCount { key: action.key, opcode: action.opcode, expected, found });
    }

    if let Some(p) = action.operands().find(|p| p.kind == ParamType::Call) {
        return Err(CpuError::InvalidOperand(p.value));
    }

    let writes = matches!(action.opcode, Opcode::Mov | Opcode::Add | Opcode::Inc | Opcode::Imul);
    match action.location {
        Some(p) if writes && p.kind == ParamType::Literal => Err(CpuError::LiteralDestination(p.value)),
        _ => Ok(()),
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state)
            .field("registers", &self.registers)
            .field("cache", &self.cache.len())
            .field("tasks", &self.tasks.len())
            .field("next_fetch", &self.next_fetch)
            .field("fetching", &self.fetching.len())
            .field("execution_index", &self.execution_index)
            .finish()
    }
}

/// Errors that can occur during CPU execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("register {index} out of range ({count} registers)")]
    RegisterOutOfRange { index: i64, count: usize },

    #[error("instruction {key}: {opcode} takes {expected} operand(s), got {found}")]
    OperandCount { key: Key, opcode: Opcode, expected: usize, found: usize },

    #[error("operand {0} is an opcode, not a register, literal or address")]
    InvalidOperand(i64),

    #[error("literal {0} used as a destination")]
    LiteralDestination(i64),

    #[error("instruction {key}: {opcode} cannot be executed here")]
    NotExecutable { key: Key, opcode: Opcode },

    #[error("label inside loop {0}: loops cannot nest")]
    NestedLoop(LoopId),

    #[error("jump to unknown loop {0}")]
    UnknownLoop(LoopId),

    #[error("instruction {0}: a comparison cannot be a branch")]
    ComparisonAsBranch(Key),

    #[error("data address {address} out of range (0-{})", .limit.saturating_sub(1))]
    AddressOutOfRange { address: i64, limit: usize },

    #[error("memory word 0x{0:x} used before it was read")]
    Unresolved(i64),

    #[error("program slot {slot} was overwritten: fetched for instruction {expected}, got {found}")]
    SlotOverwritten { slot: i64, expected: Key, found: Key },

    #[error("malformed memory response {0}")]
    MalformedResponse(Key),

    #[error("unexpected {signal:?} group {key} led by {kind:?}")]
    UnexpectedGroup { key: Key, signal: Signal, kind: FragmentType },

    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::asm::assemble;
    use crate::bus::{Bus, BusConfig, BusSender};
    use crate::isa::fragment::CPU_CHANNEL;
    use crate::memory::MemoryUnit;

    struct Rig {
        bus: Bus,
        memory: MemoryUnit,
        cpu: Cpu,
        loader: BusSender,
        encoder: Encoder,
    }

    fn names() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    fn rig() -> Rig {
        let word = WordLength::Bits16;
        let mut bus = Bus::new(BusConfig { width: 8, frequency: 100 });
        bus.make_channel(MEMORY_CHANNEL);
        bus.make_channel(CPU_CHANNEL);
        let memory = MemoryUnit::new(bus.port(MEMORY_CHANNEL).unwrap(), 1024, word).unwrap();
        let cpu = Cpu::new(bus.port(CPU_CHANNEL).unwrap(), &names(), word, memory.data_len());
        let loader = bus.sender();
        Rig { bus, memory, cpu, loader, encoder: Encoder::new(&names(), word) }
    }

    impl Rig {
        fn load(&self, source: &str) {
            let program = assemble(source, &self.encoder).unwrap();
            self.send(program.groups);
        }

        fn send(&self, groups: Vec<Vec<Fragment>>) {
            for group in groups {
                self.loader.send_to(MEMORY_CHANNEL, Origin::Loader, Signal::Write, group).unwrap();
            }
        }

        fn run(&mut self) -> Result<(), CpuError> {
            for _ in 0..5000 {
                self.bus.tick().unwrap();
                self.memory.tick().unwrap();
                self.cpu.tick()?;
                if self.bus.is_idle() && self.memory.is_idle() && self.cpu.is_idle() {
                    return Ok(());
                }
            }
            panic!("machine did not settle");
        }

        fn reg(&self, name: &str) -> i64 {
            self.cpu.registers().by_name(name).unwrap()
        }

        fn mem(&self, address: i64) -> i64 {
            self.memory.read_data(address).unwrap()
        }
    }

    fn run(source: &str) -> Rig {
        let mut r = rig();
        r.load(source);
        r.run().unwrap();
        r
    }

    fn run_err(source: &str) -> CpuError {
        let mut r = rig();
        r.load(source);
        r.run().unwrap_err()
    }

    #[test]
    fn test_mov_add_registers() {
        let r = run("mov A, 5; add A, 3");
        assert_eq!(r.reg("A"), 8);
        assert_eq!(r.reg("B"), 0);
    }

    #[test]
    fn test_imul_and_inc() {
        let r = run("mov A, 6\nimul B, A, -7\ninc B");
        assert_eq!(r.reg("B"), -41);
        assert_eq!(r.cpu.executed(), 3);
    }

    #[test]
    fn test_memory_round_trip() {
        let r = run("mov 0x10, 7; mov A, 0x10");
        assert_eq!(r.reg("A"), 7);
        assert_eq!(r.mem(0x10), 7);
    }

    #[test]
    fn test_memory_arithmetic_writes_through() {
        let r = run("mov 0x3, 4; add 0x3, 0x3; inc 0x3; imul 0x4, 0x3, 2");
        assert_eq!(r.mem(3), 9);
        assert_eq!(r.mem(4), 18);
        assert!(r.cpu.cache().is_empty());
    }

    #[test]
    fn test_arithmetic_wraps_to_word() {
        let r = run("mov A, 32767; inc A");
        assert_eq!(r.reg("A"), -32768);
    }

    #[test]
    fn test_counting_loop() {
        let r = run("label 0; inc A; A < 3 : JMP 0 : NULL");
        assert_eq!(r.reg("A"), 3);
        assert_eq!(*r.cpu.loop_state(), LoopState::Idle);
        assert_eq!(r.cpu.loops()[&0].instructions.len(), 1);
    }

    #[test]
    fn test_gteq_equal_operands_take_then_branch() {
        let r = run("mov A, 5; A >= 5 : mov B, 1 : mov B, 2");
        assert_eq!(r.reg("B"), 1);

        let r = run("mov A, 4; A >= 5 : mov B, 1 : mov B, 2");
        assert_eq!(r.reg("B"), 2);
    }

    #[test]
    fn test_signed_comparison() {
        let r = run("mov A, -1; A < 0 : mov B, 1 : mov B, 2");
        assert_eq!(r.reg("B"), 1);
    }

    #[test]
    fn test_loop_cache_defers_memory_writes() {
        let source = "mov 0x10, 0; label 0; inc 0x10; inc A; A < 6 : JMP 0 : mov B, 1";
        let r = run(source);
        assert_eq!(r.reg("A"), 6);
        assert_eq!(r.reg("B"), 1);
        // Five touches forced one write-back; the sixth increment is cached only.
        assert_eq!(r.mem(0x10), 5);
        assert_eq!(r.cpu.cache().get(0x10), Some(6));
    }

    #[test]
    fn test_null_flushes_cache() {
        let source = "mov 0x10, 0; label 0; inc 0x10; inc A; A < 6 : JMP 0 : mov B, 1; NULL";
        let r = run(source);
        assert_eq!(r.mem(0x10), 6);
        assert!(r.cpu.cache().is_empty());
    }

    #[test]
    fn test_read_after_loop_sees_cached_value() {
        let source = "label 0; inc 0x2; inc A; A < 2 : JMP 0 : mov B, 0x2";
        let r = run(source);
        assert_eq!(r.reg("B"), 2);
        assert_eq!(r.mem(2), 0);
    }

    #[test]
    fn test_jump_without_condition_replays_once() {
        let r = run("label 0; inc A; JMP 0");
        assert_eq!(r.reg("A"), 2);
        assert_eq!(*r.cpu.loop_state(), LoopState::Idle);
    }

    #[test]
    fn test_nested_label_is_fatal() {
        assert_eq!(run_err("label 0; inc A; label 1"), CpuError::NestedLoop(0));
    }

    #[test]
    fn test_unknown_loop_is_fatal() {
        assert_eq!(run_err("JMP 3"), CpuError::UnknownLoop(3));
    }

    #[test]
    fn test_operand_count_is_fatal() {
        assert!(matches!(
            run_err("mov A"),
            CpuError::OperandCount { opcode: Opcode::Mov, expected: 2, found: 1, .. }
        ));
    }

    #[test]
    fn test_literal_destination_is_fatal() {
        assert_eq!(run_err("mov 5, 1"), CpuError::LiteralDestination(5));
    }

    #[test]
    fn test_address_out_of_range_is_fatal() {
        assert!(matches!(
            run_err("mov 0x40, 1"),
            CpuError::AddressOutOfRange { address: 0x40, limit: 64 }
        ));
    }

    #[test]
    fn test_register_out_of_range_is_fatal() {
        let mut r = rig();
        let group = r
            .encoder
            .encode_words(
                0,
                Signal::Write,
                Origin::Loader,
                &[(FragmentType::Call, Opcode::Mov.code()), (FragmentType::Register, -6), (FragmentType::Literal, 1)],
            )
            .unwrap();
        r.send(vec![group]);
        assert_eq!(r.run().unwrap_err(), CpuError::RegisterOutOfRange { index: 5, count: 2 });
    }

    #[test]
    fn test_comparison_as_branch_is_fatal() {
        let mut r = rig();
        let first = r.encoder.encode(0, "<", &["A", "1"], Signal::Write, Origin::Loader).unwrap();
        let second = r.encoder.encode(1, ">", &["A", "2"], Signal::Write, Origin::Loader).unwrap();
        r.send(vec![first, second]);
        assert_eq!(r.run().unwrap_err(), CpuError::ComparisonAsBranch(1));
    }

    #[test]
    fn test_tick_is_bounded() {
        let mut r = rig();
        r.load("label 0; inc A; A > -100 : JMP 0 : NULL");
        for _ in 0..200 {
            r.bus.tick().unwrap();
            r.memory.tick().unwrap();
            assert!(r.cpu.tick().unwrap() <= MAX_STEPS_PER_TICK);
        }
    }

    fn fetch_order(order: &[usize]) -> Vec<i64> {
        let word = WordLength::Bits16;
        let mut bus = Bus::new(BusConfig { width: 8, frequency: 100 });
        bus.make_channel(MEMORY_CHANNEL);
        bus.make_channel(CPU_CHANNEL);
        let memory = bus.port(MEMORY_CHANNEL).unwrap();
        let mut cpu = Cpu::new(bus.port(CPU_CHANNEL).unwrap(), &names(), word, 64);
        let encoder = Encoder::new(&names(), word);

        let fragments: Vec<Fragment> = (0..order.len() as Key / 2)
            .flat_map(|key| {
                encoder
                    .encode_words(key, Signal::Read, Origin::Memory, &[(FragmentType::Memory, 10 + key as i64)])
                    .unwrap()
            })
            .collect();

        let mut requests = Vec::new();
        let decoder = Decoder::new(word);
        let mut reassembler = Reassembler::new();
        for &i in order {
            memory.send_to(CPU_CHANNEL, Origin::Memory, Signal::Read, vec![fragments[i]]).unwrap();
            bus.tick().unwrap();
            cpu.tick().unwrap();
            bus.tick().unwrap();
            for group in reassembler.extend(memory.drain()).unwrap() {
                requests.push((group[0].key, decoder.words(&group).unwrap()));
            }
        }
        for _ in 0..4 {
            bus.tick().unwrap();
            for group in reassembler.extend(memory.drain()).unwrap() {
                requests.push((group[0].key, decoder.words(&group).unwrap()));
            }
        }

        requests.sort_by_key(|(key, _)| *key);
        requests
            .into_iter()
            .map(|(_, words)| {
                assert_eq!(words[0].0, FragmentType::Call);
                words[0].1
            })
            .collect()
    }

    #[test]
    fn test_fetch_waits_for_turn() {
        // Both fragments of key 1 arrive before any of key 0.
        assert_eq!(fetch_order(&[2, 3, 0, 1]), vec![10, 11]);
    }

    proptest! {
        #[test]
        fn test_fetch_requests_follow_key_order(
            order in Just((0..12).collect::<Vec<usize>>()).prop_shuffle()
        ) {
            prop_assert_eq!(fetch_order(&order), (10..16).collect::<Vec<i64>>());
        }
    }
}
