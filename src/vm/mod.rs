use core::fmt;

use tracing::{debug, trace};

use crate::{
    arena::{align_cell, Arena, RAddr},
    dictionary::{CWords, Entry, Flags},
    input::{Scratch, Token, Tokenizer, SCRATCH_SIZE},
    output::OutputBuf,
    shared::{Shared, SharedBank},
    stack::Stack,
    Cell, Error, WordFunc, CELL_SIZE,
};

pub mod builtins;

/// Bytecode instruction tags.
///
/// One instruction is one or more whole Cells: the tag, then its operand
/// if it takes one. Discriminants are stable and visible to scripts; the
/// emission words write them into program memory with `,`, and the locals
/// machinery emits programs that emit them again at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(isize)]
pub enum Opcode {
    /// Never emitted; zeroed memory decodes to this.
    Unknown = 0,
    /// Push the operand Cell.
    PushImmediate = 1,
    /// Recursively enter the VM at the operand address.
    CallForth = 2,
    /// Resolve the operand handle and invoke the native word.
    CallC = 3,
    /// Pop; jump to the operand address when the popped value is zero.
    JumpIfZero = 4,
    /// Jump to the operand address.
    Jump = 5,
    /// Identical to [`Opcode::Jump`] at run time; tagged separately so
    /// the decompiler can walk over inline definitions transparently.
    JumpIgnored = 6,
    /// Push the operand'th local, counting down from the top.
    LocalPush = 7,
    /// Pop the data stack onto the locals stack.
    LocalSet = 8,
    /// Return from the current VM frame.
    Exit = 9,
}

impl Opcode {
    pub fn from_cell(bits: Cell) -> Option<Self> {
        Some(match bits {
            0 => Opcode::Unknown,
            1 => Opcode::PushImmediate,
            2 => Opcode::CallForth,
            3 => Opcode::CallC,
            4 => Opcode::JumpIfZero,
            5 => Opcode::Jump,
            6 => Opcode::JumpIgnored,
            7 => Opcode::LocalPush,
            8 => Opcode::LocalSet,
            9 => Opcode::Exit,
            _ => return None,
        })
    }

    pub const fn to_cell(self) -> Cell {
        self as Cell
    }
}

/// One self-contained Forth instance.
///
/// `T` is a host context threaded through to every native word. The
/// engine owns no memory: construction points it at host buffers which it
/// uses exclusively until dropped or released.
pub struct Forth<T: 'static> {
    pub data_stack: Stack<Cell>,
    pub(crate) locals: Stack<Cell>,
    pub(crate) cwords: CWords<T>,
    pub(crate) arena: Arena,
    pub(crate) shared: SharedBank,
    pub(crate) scratch: Scratch,
    pub output: OutputBuf,
    pub host_ctxt: T,
    last_err: Option<Error>,
}

impl<T: 'static> Forth<T> {
    /// Construct an engine over host buffers and install the builtin
    /// words.
    ///
    /// Fails with [`Error::OutOfRange`] when the shared bank cannot hold
    /// the reserved slots, or [`Error::OutOfMemory`] when program memory
    /// cannot hold the builtin dictionary.
    ///
    /// # Safety
    ///
    /// Each `(pointer, capacity)` pair must describe a writable region of
    /// at least that many elements, exclusively owned by the returned VM
    /// and outliving it. The arena buffer must be Cell-aligned.
    pub unsafe fn new(
        dstack_buf: (*mut Cell, usize),
        lstack_buf: (*mut Cell, usize),
        cwords_buf: (*mut WordFunc<T>, usize),
        arena_buf: (*mut u8, usize),
        shared_buf: (*mut Cell, usize),
        output: OutputBuf,
        host_ctxt: T,
    ) -> Result<Self, Error> {
        if shared_buf.1 < Shared::USER {
            return Err(Error::OutOfRange);
        }
        let mut vm = Self {
            data_stack: Stack::new(dstack_buf.0, dstack_buf.1),
            locals: Stack::new(lstack_buf.0, lstack_buf.1),
            cwords: CWords::new(cwords_buf.0, cwords_buf.1),
            arena: Arena::new(arena_buf.0, arena_buf.1),
            shared: SharedBank::new(shared_buf.0, shared_buf.1),
            scratch: Scratch::new(),
            output,
            host_ctxt,
            last_err: None,
        };
        // Slot 0 of the native-word table stays a sentinel so every real
        // registration gets an odd handle, distinguishable from the even
        // Cell-aligned addresses Forth bodies live at.
        vm.cwords.register(Self::invalid_cword)?;
        // Burn one Cell so no dictionary entry can sit at offset zero,
        // keeping `previous == 0` an unambiguous root marker.
        vm.arena.allot(CELL_SIZE)?;
        for bi in Self::FULL_BUILTINS {
            vm.defw(bi.name, bi.func, bi.flags)?;
        }
        Ok(vm)
    }

    fn invalid_cword(_vm: &mut Self) -> Result<(), Error> {
        Err(Error::InvalidOpcode)
    }

    /// Register a native word: a CWORD dictionary entry whose body is the
    /// handle of a fresh native-word table slot.
    pub fn defw(&mut self, name: &str, func: WordFunc<T>, flags: Flags) -> Result<(), Error> {
        let entry = self.create(name.as_bytes())?;
        entry.set_flags(&mut self.arena, flags | Flags::CWORD)?;
        let handle = self.cwords.register(func)?;
        self.arena.put_cell(handle)?;
        debug!(name, handle, "defw");
        Ok(())
    }

    /// Allocate a dictionary header for `name`, link it to LATEST, and
    /// make it the new LATEST.
    pub(crate) fn create(&mut self, name: &[u8]) -> Result<Entry, Error> {
        let addr = self.arena.here();
        let prev = self.shared.var(Shared::Latest);
        self.arena.put_cell(prev)?;
        self.arena.put_cell(Flags::NONE.bits())?;
        self.arena.put_cell(name.len() as Cell)?;
        let padded = align_cell(name.len() + 1);
        let name_addr = self.arena.allot(padded)?;
        self.arena.zero_bytes(name_addr, padded)?;
        self.arena.write_bytes(name_addr, name)?;
        self.shared.put(Shared::Latest, addr.offset());
        trace!(
            addr = addr.offset(),
            name = core::str::from_utf8(name).unwrap_or(""),
            "create"
        );
        Ok(Entry::at(addr))
    }

    /// Like [`Forth::create`] but named by the word waiting in scratch.
    pub(crate) fn create_from_scratch(&mut self) -> Result<Entry, Error> {
        let mut name = [0u8; SCRATCH_SIZE];
        let len = self.scratch.as_bytes().len();
        name[..len].copy_from_slice(self.scratch.as_bytes());
        self.create(&name[..len])
    }

    /// Walk the dictionary newest-first for a non-hidden entry whose name
    /// matches byte for byte. Newest-first gives redefinition semantics:
    /// a later definition shadows an earlier one.
    pub(crate) fn lookup(&self, name: &[u8]) -> Result<Option<Entry>, Error> {
        let mut cur = self.shared.var(Shared::Latest);
        while cur != 0 {
            let entry = Entry::at(RAddr::from_cell(cur));
            let flags = entry.flags(&self.arena)?;
            if !flags.contains(Flags::HIDDEN) && entry.name(&self.arena)? == name {
                return Ok(Some(entry));
            }
            let prev = entry.previous(&self.arena)?;
            // Entries only ever link backwards; anything else means the
            // link field was scribbled over.
            if prev >= cur {
                return Err(Error::InvalidAddress);
            }
            cur = prev;
        }
        Ok(None)
    }

    /// Format a message into scratch and pass the error through.
    pub(crate) fn errorf(&mut self, err: Error, msg: fmt::Arguments<'_>) -> Error {
        use fmt::Write;
        self.scratch.clear();
        let _ = self.scratch.write_fmt(msg);
        err
    }

    /// Run a chunk of source through the interpreter/compiler.
    ///
    /// On error the engine unwinds to top level: compile mode is left,
    /// and any entries created by the aborted definition are unlinked by
    /// restoring LATEST from the DICT_ROOT snapshot. Already emitted
    /// bytes stay in the arena; hosts that want atomic definitions can
    /// snapshot [`Forth::here`] and LATEST and call
    /// [`Forth::rewind_dictionary`].
    pub fn exec(&mut self, input: &str) -> Result<(), Error> {
        match self.exec_inner(input) {
            Ok(()) => {
                self.last_err = None;
                Ok(())
            }
            Err(err) => {
                self.last_err = Some(err);
                debug!(%err, "exec failed");
                if self.shared.var(Shared::Compiling) != 0 {
                    let root = self.shared.var(Shared::DictRoot);
                    if root != 0 {
                        self.shared.put(Shared::Latest, root);
                    }
                    self.shared.put(Shared::Compiling, 0);
                    self.shared.put(Shared::LocalCount, 0);
                }
                self.shared.put(Shared::WordAvailable, 0);
                Err(err)
            }
        }
    }

    fn exec_inner(&mut self, input: &str) -> Result<(), Error> {
        let mut tokens = Tokenizer::new(input.as_bytes());
        loop {
            match tokens.next_token(&mut self.scratch)? {
                Token::End => return Ok(()),
                Token::Number(n) => {
                    if self.shared.var(Shared::Compiling) == 0 {
                        self.data_stack.push(n)?;
                    } else {
                        self.arena.put_cell(Opcode::PushImmediate.to_cell())?;
                        self.arena.put_cell(n)?;
                    }
                }
                Token::Word => self.interpret_word(&mut tokens)?,
            }
        }
    }

    fn interpret_word(&mut self, tokens: &mut Tokenizer<'_>) -> Result<(), Error> {
        let entry = match self.lookup(self.scratch.as_bytes())? {
            Some(entry) => entry,
            // Scratch still holds the offending name for the host to
            // report alongside the error.
            None => return Err(Error::WordNotFound),
        };
        let flags = entry.flags(&self.arena)?;
        let compiling = self.shared.var(Shared::Compiling) != 0;

        if !compiling && flags.contains(Flags::COMPILE_ONLY) {
            return Err(Error::CompileOnly);
        }

        if compiling && !flags.contains(Flags::IMMEDIATE) {
            let body = entry.body(&self.arena)?;
            if flags.contains(Flags::CWORD) {
                let handle = self.arena.load(body)?;
                self.arena.put_cell(Opcode::CallC.to_cell())?;
                self.arena.put_cell(handle)?;
            } else {
                self.arena.put_cell(Opcode::CallForth.to_cell())?;
                self.arena.put_cell(body.offset())?;
            }
            return Ok(());
        }

        // Interpreting, or an immediate word in compile mode: run it now.
        let body = entry.body(&self.arena)?;
        if flags.contains(Flags::CWORD) {
            let handle = self.arena.load(body)?;
            let func = self.cwords.resolve(handle)?;
            let mut res = func(self);
            // The feed-me-a-word protocol: install the next raw token in
            // scratch and re-invoke the same word until it stops asking.
            // A word may ask repeatedly to consume a whole sub-grammar.
            while res == Err(Error::WantWord) {
                if tokens.next_token(&mut self.scratch)? != Token::Word {
                    return Err(Error::WantWord);
                }
                self.shared.put(Shared::WordAvailable, 1);
                res = func(self);
            }
            res
        } else {
            self.exec_at(body)
        }
    }

    /// Enter the VM at a compiled body.
    ///
    /// Locals pushed during execution are unwound before this returns,
    /// error or not, so a word cannot leak locals into its caller.
    pub fn exec_at(&mut self, code: RAddr) -> Result<(), Error> {
        if !self.arena.raddr_valid(code) {
            return Err(self.errorf(
                Error::InvalidAddress,
                format_args!("exec at invalid address {}", code.offset()),
            ));
        }
        let saved = self.locals.depth();
        let res = self.run(code);
        self.locals.truncate(saved);
        res
    }

    fn run(&mut self, mut code: RAddr) -> Result<(), Error> {
        let mut ip = 0usize;
        loop {
            let opaddr = code.cell(ip);
            let op = self.arena.load(opaddr)?;
            ip += 1;
            match Opcode::from_cell(op) {
                Some(Opcode::PushImmediate) => {
                    let n = self.arena.load(code.cell(ip))?;
                    ip += 1;
                    trace!(at = opaddr.offset(), n, "push-immediate");
                    self.data_stack.push(n)?;
                }
                Some(Opcode::CallForth) => {
                    let target = RAddr::from_cell(self.arena.load(code.cell(ip))?);
                    ip += 1;
                    trace!(at = opaddr.offset(), target = target.offset(), "call-forth");
                    self.exec_at(target)?;
                }
                Some(Opcode::CallC) => {
                    let handle = self.arena.load(code.cell(ip))?;
                    ip += 1;
                    trace!(at = opaddr.offset(), handle, "call-c");
                    let func = self.cwords.resolve(handle)?;
                    func(self)?;
                }
                Some(Opcode::JumpIfZero) => {
                    let target = RAddr::from_cell(self.arena.load(code.cell(ip))?);
                    ip += 1;
                    let flag = self.data_stack.try_pop()?;
                    trace!(at = opaddr.offset(), target = target.offset(), flag, "jump-zero");
                    if flag == 0 {
                        if !self.arena.raddr_valid(target) {
                            return Err(Error::InvalidAddress);
                        }
                        code = target;
                        ip = 0;
                    }
                }
                Some(Opcode::Jump) | Some(Opcode::JumpIgnored) => {
                    let target = RAddr::from_cell(self.arena.load(code.cell(ip))?);
                    trace!(at = opaddr.offset(), target = target.offset(), "jump");
                    if !self.arena.raddr_valid(target) {
                        return Err(Error::InvalidAddress);
                    }
                    code = target;
                    ip = 0;
                }
                Some(Opcode::LocalPush) => {
                    let idx = self.arena.load(code.cell(ip))?;
                    ip += 1;
                    if idx < 0 {
                        return Err(Error::OutOfRange);
                    }
                    let val = self.locals.pick(idx as usize)?;
                    self.data_stack.push(val)?;
                }
                Some(Opcode::LocalSet) => {
                    let val = self.data_stack.try_pop()?;
                    self.locals.push(val)?;
                }
                Some(Opcode::Exit) => {
                    trace!(at = opaddr.offset(), "exit");
                    return Ok(());
                }
                Some(Opcode::Unknown) | None => {
                    return Err(self.errorf(
                        Error::InvalidOpcode,
                        format_args!("invalid opcode {} at {}", op, opaddr.offset()),
                    ));
                }
            }
        }
    }

    /// The cursor into program memory; everything below it is allocated.
    pub fn here(&self) -> RAddr {
        self.arena.here()
    }

    /// Depth of the locals stack. Zero between top-level calls.
    pub fn locals_depth(&self) -> usize {
        self.locals.depth()
    }

    /// Read a shared-bank slot by index. Reserved slots come first; host
    /// slots start at [`Shared::USER`].
    pub fn shared_get(&self, idx: usize) -> Result<Cell, Error> {
        self.shared.get(idx)
    }

    /// Write a shared-bank slot by index.
    pub fn shared_set(&mut self, idx: usize, val: Cell) -> Result<(), Error> {
        self.shared.set(idx, val)
    }

    /// The error the last [`Forth::exec`] surfaced, if it failed.
    pub fn last_error(&self) -> Option<Error> {
        self.last_err
    }

    /// The message left in scratch by the last failure, when there is
    /// one. After [`Error::WordNotFound`] this is the offending word.
    pub fn error_message(&self) -> &str {
        self.scratch.as_str()
    }

    /// Reinstate a (here, LATEST) snapshot taken before an `exec` call,
    /// discarding everything defined since. `latest` must be an entry
    /// address (or 0) at or below the snapshot.
    pub fn rewind_dictionary(&mut self, here: RAddr, latest: Cell) -> Result<(), Error> {
        self.arena.rewind(here)?;
        self.shared.put(Shared::Latest, latest);
        Ok(())
    }

    /// Tear down the engine and hand the host context back.
    pub fn release(self) -> T {
        self.host_ctxt
    }
}

// A Forth VM holds raw pointers, but they point into regions the
// constructor's contract makes exclusively owned by this VM for its whole
// lifetime, and they are only dereferenced through methods taking the VM
// itself. Moving the VM to another thread moves that exclusive ownership
// with it.
unsafe impl<T: Send> Send for Forth<T> {}

#[cfg(test)]
pub mod test {
    use super::{Forth, Opcode};
    use crate::{
        dictionary::Flags,
        leakbox::{LBForth, Params},
        Cell, Error,
    };

    #[test]
    fn opcode_tags_are_stable() {
        for bits in 0..=9 {
            let op = Opcode::from_cell(bits).unwrap();
            assert_eq!(op.to_cell(), bits);
        }
        assert_eq!(Opcode::from_cell(10), None);
        assert_eq!(Opcode::from_cell(-1), None);
    }

    #[test]
    fn builtin_handles_are_odd() {
        let lb: LBForth<()> = LBForth::from_params(Params::default(), ());
        let forth = &lb.forth;
        for bi in Forth::<()>::FULL_BUILTINS {
            let entry = forth.lookup(bi.name.as_bytes()).unwrap().unwrap();
            let flags = entry.flags(&forth.arena).unwrap();
            assert!(flags.contains(Flags::CWORD), "{} not a cword", bi.name);
            let handle = forth.arena.load(entry.body(&forth.arena).unwrap()).unwrap();
            assert_eq!(handle & 1, 1, "{} got even handle {}", bi.name, handle);
            assert!(forth.cwords.resolve(handle).is_ok());
        }
    }

    #[test]
    fn dictionary_links_backwards() {
        let mut lb: LBForth<()> = LBForth::from_params(Params::default(), ());
        lb.forth.exec(": a 1 ; : b 2 ; : c 3 ;").unwrap();
        let forth = &lb.forth;
        let mut cur = forth.shared_get(crate::shared::Shared::Latest as usize).unwrap();
        let mut hops = 0;
        while cur != 0 {
            let entry = crate::dictionary::Entry::at(crate::RAddr::from_cell(cur));
            let prev = entry.previous(&forth.arena).unwrap();
            assert!(prev < cur);
            cur = prev;
            hops += 1;
        }
        assert!(hops > Forth::<()>::FULL_BUILTINS.len());
    }

    #[test]
    fn shared_bank_too_small() {
        use crate::{leakbox::LeakBox, output::OutputBuf, WordFunc};

        let dstack: LeakBox<Cell> = LeakBox::new(8);
        let lstack: LeakBox<Cell> = LeakBox::new(8);
        let cwords: LeakBox<WordFunc<()>> = LeakBox::new(64);
        let arena: LeakBox<Cell> = LeakBox::new(512);
        let shared: LeakBox<Cell> = LeakBox::new(2);
        let outbuf: LeakBox<u8> = LeakBox::new(64);

        let res = unsafe {
            Forth::<()>::new(
                (dstack.ptr(), dstack.len()),
                (lstack.ptr(), lstack.len()),
                (cwords.ptr(), cwords.len()),
                (arena.ptr().cast::<u8>(), arena.len() * crate::CELL_SIZE),
                (shared.ptr(), shared.len()),
                OutputBuf::new(outbuf.ptr(), outbuf.len()),
                (),
            )
        };
        assert!(matches!(res, Err(Error::OutOfRange)));
    }
}
