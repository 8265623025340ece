use crate::{
    arena::{align_cell, Arena, RAddr},
    Cell, Error, WordFunc,
};

/// Dictionary entry flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(Cell);

impl Flags {
    pub const NONE: Self = Self(0);
    /// Executes even in compile mode.
    pub const IMMEDIATE: Self = Self(1 << 1);
    /// Body is a native-word handle rather than bytecode.
    pub const CWORD: Self = Self(1 << 2);
    /// Skipped by lookup.
    pub const HIDDEN: Self = Self(1 << 3);
    /// Legal only while compiling.
    pub const COMPILE_ONLY: Self = Self(1 << 4);

    pub const fn bits(self) -> Cell {
        self.0
    }

    pub const fn from_bits(bits: Cell) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// Entry header layout, in Cells from the entry address: the previous
// entry's RAddr (0 at the root), the flag bits, and the name length. The
// NUL-terminated name follows, padded to a Cell boundary, then the body.
const PREVIOUS: usize = 0;
const FLAGS: usize = 1;
const NAME_LEN: usize = 2;
pub(crate) const HEADER_CELLS: usize = 3;

/// A dictionary entry: a named record embedded in the arena, addressed
/// relative to the arena base.
///
/// The body of a CWORD entry is a single Cell holding a native-word
/// handle. The body of a Forth entry is bytecode ending at the first
/// `Exit` reachable by forward flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry(RAddr);

impl Entry {
    pub(crate) fn at(addr: RAddr) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> RAddr {
        self.0
    }

    /// The raw link Cell: the previous entry's address, or 0 at the root.
    pub fn previous(self, arena: &Arena) -> Result<Cell, Error> {
        arena.load(self.0.cell(PREVIOUS))
    }

    pub fn flags(self, arena: &Arena) -> Result<Flags, Error> {
        Ok(Flags::from_bits(arena.load(self.0.cell(FLAGS))?))
    }

    pub(crate) fn set_flags(self, arena: &mut Arena, flags: Flags) -> Result<(), Error> {
        arena.store(self.0.cell(FLAGS), flags.bits())
    }

    pub fn name_len(self, arena: &Arena) -> Result<usize, Error> {
        let len = arena.load(self.0.cell(NAME_LEN))?;
        if len < 0 {
            return Err(Error::InvalidAddress);
        }
        Ok(len as usize)
    }

    pub fn name(self, arena: &Arena) -> Result<&[u8], Error> {
        let len = self.name_len(arena)?;
        arena.bytes(self.0.cell(HEADER_CELLS), len)
    }

    /// Address of the entry's Cell-aligned payload.
    pub fn body(self, arena: &Arena) -> Result<RAddr, Error> {
        let len = self.name_len(arena)?;
        Ok(self.0.cell(HEADER_CELLS + align_cell(len + 1) / crate::CELL_SIZE))
    }
}

/// The native-word table.
///
/// Host callbacks live in a bounded host-provided array and are referenced
/// from compiled code only through derived handles: table index `k` maps
/// to handle `2k - 1`, so every real handle is odd while call-target
/// addresses are even. Corrupted bytecode can at worst invoke the wrong
/// registered word, never a wild address.
pub struct CWords<T: 'static> {
    table: *mut WordFunc<T>,
    len: usize,
    capacity: usize,
}

impl<T: 'static> CWords<T> {
    pub fn new(table: *mut WordFunc<T>, capacity: usize) -> Self {
        Self {
            table,
            len: 0,
            capacity,
        }
    }

    /// Append a callback, returning its handle. The first registration is
    /// expected to be a sentinel: it gets handle 0, which never resolves.
    pub fn register(&mut self, func: WordFunc<T>) -> Result<Cell, Error> {
        if self.len == self.capacity {
            return Err(Error::OutOfMemory);
        }
        let handle = if self.len == 0 {
            0
        } else {
            (self.len * 2 - 1) as Cell
        };
        unsafe {
            self.table.add(self.len).write(func);
        }
        self.len += 1;
        Ok(handle)
    }

    pub fn resolve(&self, handle: Cell) -> Result<WordFunc<T>, Error> {
        if handle & 1 == 0 {
            return Err(Error::InvalidOpcode);
        }
        let idx = ((handle + 1) / 2) as usize;
        if idx == 0 || idx >= self.len {
            return Err(Error::OutOfRange);
        }
        Ok(unsafe { self.table.add(idx).read() })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
