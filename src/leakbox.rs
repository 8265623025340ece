//! Heap-backed buffers shaped the way the engine wants host buffers:
//! raw pointer + capacity. For tests and hosts that do have an allocator.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::UnsafeCell,
    mem::MaybeUninit,
};

use serde::{Deserialize, Serialize};

use crate::{output::OutputBuf, Cell, Forth, WordFunc, CELL_SIZE};

/// A leaked allocation handed out as a raw pointer, un-leaked on drop.
pub struct LeakBox<T> {
    ptr: *mut UnsafeCell<MaybeUninit<T>>,
    len: usize,
}

impl<T> LeakBox<T> {
    pub fn new(len: usize) -> Self {
        assert!(len > 0);
        Self {
            ptr: unsafe {
                System
                    .alloc(Layout::array::<UnsafeCell<MaybeUninit<T>>>(len).unwrap())
                    .cast()
            },
            len,
        }
    }

    pub fn ptr(&self) -> *mut T {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Drop for LeakBox<T> {
    fn drop(&mut self) {
        unsafe {
            System.dealloc(
                self.ptr.cast(),
                Layout::array::<UnsafeCell<MaybeUninit<T>>>(self.len).unwrap(),
            )
        }
    }
}

/// Buffer sizes for a self-contained engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Params {
    #[serde(default = "Params::default_data_stack_elems")]
    pub data_stack_elems: usize,
    #[serde(default = "Params::default_locals_stack_elems")]
    pub locals_stack_elems: usize,
    #[serde(default = "Params::default_cword_table_elems")]
    pub cword_table_elems: usize,
    #[serde(default = "Params::default_memory_bytes")]
    pub memory_bytes: usize,
    #[serde(default = "Params::default_shared_elems")]
    pub shared_elems: usize,
    #[serde(default = "Params::default_output_buf_bytes")]
    pub output_buf_bytes: usize,
}

impl Params {
    const fn default_data_stack_elems() -> usize {
        256
    }

    const fn default_locals_stack_elems() -> usize {
        256
    }

    const fn default_cword_table_elems() -> usize {
        128
    }

    const fn default_memory_bytes() -> usize {
        64 * 1024
    }

    const fn default_shared_elems() -> usize {
        16
    }

    const fn default_output_buf_bytes() -> usize {
        1024
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            data_stack_elems: Self::default_data_stack_elems(),
            locals_stack_elems: Self::default_locals_stack_elems(),
            cword_table_elems: Self::default_cword_table_elems(),
            memory_bytes: Self::default_memory_bytes(),
            shared_elems: Self::default_shared_elems(),
            output_buf_bytes: Self::default_output_buf_bytes(),
        }
    }
}

/// A [`Forth`] bundled with owned buffers.
pub struct LBForth<T: 'static> {
    pub forth: Forth<T>,
    _payload_dstack: LeakBox<Cell>,
    _payload_lstack: LeakBox<Cell>,
    _payload_cwords: LeakBox<WordFunc<T>>,
    _payload_arena: LeakBox<Cell>,
    _payload_shared: LeakBox<Cell>,
    _payload_output: LeakBox<u8>,
}

impl<T: 'static> LBForth<T> {
    pub fn from_params(params: Params, host_ctxt: T) -> Self {
        let _payload_dstack: LeakBox<Cell> = LeakBox::new(params.data_stack_elems);
        let _payload_lstack: LeakBox<Cell> = LeakBox::new(params.locals_stack_elems);
        let _payload_cwords: LeakBox<WordFunc<T>> = LeakBox::new(params.cword_table_elems);
        // Cell-sized backing keeps the arena Cell-aligned.
        let arena_cells = (params.memory_bytes + CELL_SIZE - 1) / CELL_SIZE;
        let _payload_arena: LeakBox<Cell> = LeakBox::new(arena_cells);
        let _payload_shared: LeakBox<Cell> = LeakBox::new(params.shared_elems);
        let _payload_output: LeakBox<u8> = LeakBox::new(params.output_buf_bytes);

        let output = OutputBuf::new(_payload_output.ptr(), _payload_output.len());
        let forth = unsafe {
            Forth::<T>::new(
                (_payload_dstack.ptr(), _payload_dstack.len()),
                (_payload_lstack.ptr(), _payload_lstack.len()),
                (_payload_cwords.ptr(), _payload_cwords.len()),
                (_payload_arena.ptr().cast::<u8>(), arena_cells * CELL_SIZE),
                (_payload_shared.ptr(), _payload_shared.len()),
                output,
                host_ctxt,
            )
            .unwrap()
        };

        Self {
            forth,
            _payload_dstack,
            _payload_lstack,
            _payload_cwords,
            _payload_arena,
            _payload_shared,
            _payload_output,
        }
    }
}
