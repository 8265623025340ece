use core::fmt::Write;

use crate::{
    arena::RAddr,
    dictionary::{Entry, Flags},
    output::OutputError,
    shared::Shared,
    vm::{Forth, Opcode},
    Cell, Error, WordFunc, CELL_SIZE,
};

/// One row of the builtin table: a word installed at construction.
pub struct Builtin<T: 'static> {
    pub name: &'static str,
    pub flags: Flags,
    pub func: WordFunc<T>,
}

macro_rules! builtin {
    ($name:literal, $func:expr) => {
        Builtin {
            name: $name,
            flags: Flags::NONE,
            func: $func,
        }
    };
    ($name:literal, $flags:expr, $func:expr) => {
        Builtin {
            name: $name,
            flags: $flags,
            func: $func,
        }
    };
}

impl<T: 'static> Forth<T> {
    /// Every word installed by [`Forth::new`]. Hosts register more with
    /// [`Forth::defw`].
    pub const FULL_BUILTINS: &'static [Builtin<T>] = &[
        // Arithmetic and comparison.
        builtin!("+", Self::add),
        builtin!("-", Self::sub),
        builtin!("*", Self::mul),
        builtin!("/", Self::div),
        builtin!("mod", Self::modulo),
        builtin!("=", Self::equal),
        builtin!(">", Self::greater),
        builtin!("not", Self::invert),
        // Stack manipulation.
        builtin!("dup", Self::dup),
        builtin!("drop", Self::drop_top),
        builtin!("swap", Self::swap),
        // Output.
        builtin!(".", Self::pop_print),
        builtin!("emit", Self::emit),
        builtin!("cr", Self::cr),
        // Memory.
        builtin!("here", Self::here_addr),
        builtin!("WORD", Self::word_size),
        builtin!(",", Self::comma),
        builtin!("!", Self::store),
        builtin!("@", Self::fetch),
        // Meta and defining words.
        builtin!("'", Self::tick),
        builtin!("immediate", Self::immediate),
        builtin!("compile-only", Self::compile_only),
        builtin!(":", Self::colon),
        builtin!(
            ";",
            Flags::IMMEDIATE.union(Flags::COMPILE_ONLY),
            Self::semicolon
        ),
        builtin!(
            "{",
            Flags::IMMEDIATE.union(Flags::COMPILE_ONLY),
            Self::locals_block
        ),
        builtin!("decompile", Self::decompile),
    ];

    pub fn add(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        self.data_stack.push(b.wrapping_add(a))?;
        Ok(())
    }

    pub fn sub(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        self.data_stack.push(b.wrapping_sub(a))?;
        Ok(())
    }

    pub fn mul(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        self.data_stack.push(b.wrapping_mul(a))?;
        Ok(())
    }

    pub fn div(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        if a == 0 {
            return Err(Error::DivideByZero);
        }
        self.data_stack.push(b.wrapping_div(a))?;
        Ok(())
    }

    pub fn modulo(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        if a == 0 {
            return Err(Error::DivideByZero);
        }
        self.data_stack.push(b.wrapping_rem(a))?;
        Ok(())
    }

    pub fn equal(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        self.data_stack.push(if b == a { -1 } else { 0 })?;
        Ok(())
    }

    pub fn greater(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        self.data_stack.push(if b > a { -1 } else { 0 })?;
        Ok(())
    }

    pub fn invert(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        self.data_stack.push(if a == 0 { -1 } else { 0 })?;
        Ok(())
    }

    pub fn dup(&mut self) -> Result<(), Error> {
        let val = self.data_stack.try_peek()?;
        self.data_stack.push(val)?;
        Ok(())
    }

    pub fn drop_top(&mut self) -> Result<(), Error> {
        let _ = self.data_stack.try_pop()?;
        Ok(())
    }

    pub fn swap(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        let b = self.data_stack.try_pop()?;
        self.data_stack.push(a)?;
        self.data_stack.push(b)?;
        Ok(())
    }

    pub fn pop_print(&mut self) -> Result<(), Error> {
        let a = self.data_stack.try_pop()?;
        write!(&mut self.output, "{} ", a).map_err(|_| OutputError::FormattingErr)?;
        Ok(())
    }

    pub fn emit(&mut self) -> Result<(), Error> {
        let val = self.data_stack.try_pop()?;
        self.output.push_bstr(&[val as u8])?;
        Ok(())
    }

    pub fn cr(&mut self) -> Result<(), Error> {
        self.output.push_bstr(b"\n")?;
        Ok(())
    }

    pub fn here_addr(&mut self) -> Result<(), Error> {
        let here = self.arena.here().offset();
        self.data_stack.push(here)?;
        Ok(())
    }

    pub fn word_size(&mut self) -> Result<(), Error> {
        self.data_stack.push(CELL_SIZE as Cell)?;
        Ok(())
    }

    /// `,` pops a Cell and appends it to program memory.
    pub fn comma(&mut self) -> Result<(), Error> {
        let val = self.data_stack.try_pop()?;
        self.arena.put_cell(val)
    }

    /// `!` pops an address, then a value, and stores the value there.
    /// The address is user-supplied, hence the checked store.
    pub fn store(&mut self) -> Result<(), Error> {
        let addr = self.data_stack.try_pop()?;
        let val = self.data_stack.try_pop()?;
        self.arena.store(RAddr::from_cell(addr), val)
    }

    /// `@` pops an address and pushes the Cell stored there.
    pub fn fetch(&mut self) -> Result<(), Error> {
        let addr = self.data_stack.try_pop()?;
        let val = self.arena.load(RAddr::from_cell(addr))?;
        self.data_stack.push(val)?;
        Ok(())
    }

    /// `'` takes the next word from the input and pushes the address of
    /// its body. Native words have handles, not addresses, so they are
    /// refused.
    pub fn tick(&mut self) -> Result<(), Error> {
        if self.shared.var(Shared::WordAvailable) == 0 {
            return Err(Error::WantWord);
        }
        self.shared.put(Shared::WordAvailable, 0);
        let entry = match self.lookup(self.scratch.as_bytes())? {
            Some(entry) => entry,
            None => return Err(Error::WordNotFound),
        };
        if entry.flags(&self.arena)?.contains(Flags::CWORD) {
            return Err(Error::ExpectedForthWord);
        }
        let body = entry.body(&self.arena)?;
        self.data_stack.push(body.offset())?;
        Ok(())
    }

    /// Mark the newest definition as executing at compile time.
    pub fn immediate(&mut self) -> Result<(), Error> {
        self.mark_latest(Flags::IMMEDIATE)
    }

    /// Mark the newest definition as legal only while compiling.
    pub fn compile_only(&mut self) -> Result<(), Error> {
        self.mark_latest(Flags::COMPILE_ONLY)
    }

    fn mark_latest(&mut self, flag: Flags) -> Result<(), Error> {
        let latest = self.shared.var(Shared::Latest);
        if latest == 0 {
            return Err(Error::WordNotFound);
        }
        let entry = Entry::at(RAddr::from_cell(latest));
        let flags = entry.flags(&self.arena)?;
        if !flags.contains(flag) {
            entry.set_flags(&mut self.arena, flags | flag)?;
        }
        Ok(())
    }

    /// `:` takes a name, enters compile mode, and opens a definition.
    /// The new entry is snapshotted into DICT_ROOT so `;` can unlink
    /// anything defined during the body.
    pub fn colon(&mut self) -> Result<(), Error> {
        if self.shared.var(Shared::WordAvailable) == 0 {
            return Err(Error::WantWord);
        }
        self.shared.put(Shared::WordAvailable, 0);
        self.shared.put(Shared::Compiling, 1);
        self.create_from_scratch()?;
        let latest = self.shared.var(Shared::Latest);
        self.shared.put(Shared::DictRoot, latest);
        Ok(())
    }

    /// `;` closes the open definition: terminate the body, leave compile
    /// mode, and restore LATEST so locals defined in the body go out of
    /// scope.
    pub fn semicolon(&mut self) -> Result<(), Error> {
        self.arena.put_cell(Opcode::Exit.to_cell())?;
        self.shared.put(Shared::Compiling, 0);
        let root = self.shared.var(Shared::DictRoot);
        self.shared.put(Shared::Latest, root);
        Ok(())
    }

    /// `{` consumes names until `}`, binding each as a local of the open
    /// definition.
    ///
    /// Each name becomes an immediate dictionary entry defined inline in
    /// the enclosing word's body; its own body is a small compile-time
    /// program that, when the name is mentioned later in the definition,
    /// emits `LocalPush <index>` into the enclosing word. A `JumpIgnored`
    /// over the inline entry keeps run-time control flow out of it. At
    /// `}`, one `LocalSet` per name pops the initial values off the data
    /// stack in reverse declaration order.
    pub fn locals_block(&mut self) -> Result<(), Error> {
        if self.shared.var(Shared::WordAvailable) == 0 {
            return Err(Error::WantWord);
        }

        if self.scratch.as_bytes() == b"}" {
            let count = self.shared.var(Shared::LocalCount);
            for _ in 0..count {
                self.arena.put_cell(Opcode::LocalSet.to_cell())?;
            }
            self.shared.put(Shared::LocalCount, 0);
            self.shared.put(Shared::WordAvailable, 0);
            return Ok(());
        }

        self.arena.put_cell(Opcode::JumpIgnored.to_cell())?;
        let patch = self.arena.here();
        self.arena.put_cell(-1)?;

        let entry = self.create_from_scratch()?;
        entry.set_flags(&mut self.arena, Flags::IMMEDIATE.union(Flags::COMPILE_ONLY))?;
        let index = self.shared.var(Shared::LocalCount);
        self.arena.put_cell(Opcode::PushImmediate.to_cell())?;
        self.arena.put_cell(Opcode::LocalPush.to_cell())?;
        self.compile_cword_call(b",")?;
        self.arena.put_cell(Opcode::PushImmediate.to_cell())?;
        self.arena.put_cell(index)?;
        self.compile_cword_call(b",")?;
        self.arena.put_cell(Opcode::Exit.to_cell())?;

        self.shared.put(Shared::LocalCount, index + 1);
        let after = self.arena.here().offset();
        self.arena.store(patch, after)?;
        self.shared.put(Shared::WordAvailable, 0);
        Err(Error::WantWord)
    }

    /// Emit a call to a named native word.
    fn compile_cword_call(&mut self, name: &[u8]) -> Result<(), Error> {
        let entry = match self.lookup(name)? {
            Some(entry) => entry,
            None => return Err(Error::WordNotFound),
        };
        if !entry.flags(&self.arena)?.contains(Flags::CWORD) {
            return Err(Error::ExpectedCWord);
        }
        let handle = self.arena.load(entry.body(&self.arena)?)?;
        self.arena.put_cell(Opcode::CallC.to_cell())?;
        self.arena.put_cell(handle)
    }

    /// Pop an execution token and print its bytecode, one instruction per
    /// line, until `Exit`. `JumpIgnored` is followed rather than printed
    /// as control flow, so inline locals read naturally. The walk is
    /// bounded by everything compiled so far, so cyclic chains terminate.
    pub fn decompile(&mut self) -> Result<(), Error> {
        let addr = self.data_stack.try_pop()?;
        let mut code = RAddr::from_cell(addr);
        let mut ip = 0usize;
        let mut budget = self.arena.used() / CELL_SIZE + 1;
        loop {
            if budget == 0 {
                self.output.push_str("...\n")?;
                return Ok(());
            }
            budget -= 1;

            let opaddr = code.cell(ip);
            let op = self.arena.load(opaddr)?;
            ip += 1;
            match Opcode::from_cell(op) {
                Some(Opcode::LocalSet) => {
                    writeln!(&mut self.output, "LocalSet @ {}", opaddr.offset())
                        .map_err(|_| OutputError::FormattingErr)?;
                }
                Some(Opcode::Exit) => {
                    writeln!(&mut self.output, "Exit @ {}", opaddr.offset())
                        .map_err(|_| OutputError::FormattingErr)?;
                    return Ok(());
                }
                Some(Opcode::JumpIgnored) => {
                    let target = self.arena.load(code.cell(ip))?;
                    writeln!(
                        &mut self.output,
                        "JumpIgnored @ {} ({})",
                        opaddr.offset(),
                        target
                    )
                    .map_err(|_| OutputError::FormattingErr)?;
                    code = RAddr::from_cell(target);
                    if !self.arena.raddr_valid(code) {
                        return Err(Error::InvalidAddress);
                    }
                    ip = 0;
                }
                Some(
                    op @ (Opcode::PushImmediate
                    | Opcode::CallForth
                    | Opcode::CallC
                    | Opcode::JumpIfZero
                    | Opcode::Jump
                    | Opcode::LocalPush),
                ) => {
                    let operand = self.arena.load(code.cell(ip))?;
                    ip += 1;
                    writeln!(
                        &mut self.output,
                        "{:?} @ {} ({})",
                        op,
                        opaddr.offset(),
                        operand
                    )
                    .map_err(|_| OutputError::FormattingErr)?;
                }
                Some(Opcode::Unknown) | None => {
                    writeln!(
                        &mut self.output,
                        "invalid opcode {} @ {}",
                        op,
                        opaddr.offset()
                    )
                    .map_err(|_| OutputError::FormattingErr)?;
                    return Ok(());
                }
            }
        }
    }
}
