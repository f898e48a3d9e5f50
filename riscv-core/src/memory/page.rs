//! A single fixed-size guest memory page and its attributes.
//!
//! Grounded on `examples/original_source/lib/libriscv/page.hpp`: a page is
//! either owned (freed with the page) or non-owning (a view into memory with
//! an external lifetime, e.g. the ELF image). The original tracks that with
//! a bare `non_owning` bool plus manual `release()`/`reset()` discipline; the
//! design notes in spec.md §9 call that bit "load-bearing" and recommend a
//! sum type instead, which is what `PageBody` below is.

use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

/// Page size in bytes. Power-of-two, compile-time constant per spec.md §6.
pub const PAGE_SIZE: usize = 4096;
/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

bitflags! {
    /// Page protection and behavior flags (spec.md §3's `PageAttributes`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttr: u16 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const EXEC        = 1 << 2;
        const COW         = 1 << 3;
        const DONT_FORK   = 1 << 4;
        const CACHEABLE   = 1 << 5;
        const USER0 = 1 << 8;
        const USER1 = 1 << 9;
        const USER2 = 1 << 10;
        const USER3 = 1 << 11;
        const USER4 = 1 << 12;
        const USER5 = 1 << 13;
        const USER6 = 1 << 14;
        const USER7 = 1 << 15;
    }
}

impl Default for PageAttr {
    fn default() -> Self {
        // Matches the original's `PageAttributes{}`: readable+writable, not
        // executable, cacheable, not CoW.
        PageAttr::READ | PageAttr::WRITE | PageAttr::CACHEABLE
    }
}

impl PageAttr {
    pub fn is_default(self) -> bool {
        self == PageAttr::default()
    }
}

bitflags! {
    /// Access mode reported to a page trap callback (spec.md §4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrapMode: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const EXEC  = 0b0100;
    }
}

/// Details passed to a trap callback on each triggering access.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    pub pageno: u64,
    pub offset: u32,
    pub mode: TrapMode,
    pub value: i64,
}

/// `FnMut` invoked on a trapping access. Wrapped in `Arc<Mutex<_>>` so a page
/// can be cheaply cloned (fork) while keeping exactly one callback instance.
pub type TrapCallback = Arc<Mutex<dyn FnMut(TrapEvent) + Send>>;

/// Owned or borrowed page backing storage (see module docs).
#[derive(Clone)]
pub enum PageBody {
    /// Memory released when the page is dropped.
    Owned(Arc<[u8; PAGE_SIZE]>),
    /// A view into memory whose lifetime is managed elsewhere (the ELF
    /// image, or another page's owned buffer during CoW sharing). Kept
    /// alive for exactly as long as this page by the `Arc`.
    Borrowed { backing: Arc<Vec<u8>>, offset: usize },
}

impl PageBody {
    pub fn zeroed() -> Self {
        PageBody::Owned(Arc::new([0u8; PAGE_SIZE]))
    }

    pub fn from_bytes(bytes: [u8; PAGE_SIZE]) -> Self {
        PageBody::Owned(Arc::new(bytes))
    }

    pub fn is_owning(&self) -> bool {
        matches!(self, PageBody::Owned(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            PageBody::Owned(buf) => buf.as_ref(),
            PageBody::Borrowed { backing, offset } => &backing[*offset..*offset + PAGE_SIZE],
        }
    }

    /// Materialize a private, writable copy of this page's bytes.
    pub fn to_owned_copy(&self) -> PageBody {
        let mut buf = [0u8; PAGE_SIZE];
        buf.copy_from_slice(self.as_slice());
        PageBody::Owned(Arc::new(buf))
    }
}

/// A single guest memory page: fixed-size buffer plus attributes and an
/// optional trap callback.
#[derive(Clone)]
pub struct Page {
    pub attr: PageAttr,
    body: PageBody,
    trap: Option<TrapCallback>,
}

impl Page {
    pub fn new(attr: PageAttr, body: PageBody) -> Self {
        Page { attr, body, trap: None }
    }

    pub fn zeroed(attr: PageAttr) -> Self {
        Page::new(attr, PageBody::zeroed())
    }

    /// The process-wide guard page: all access denied.
    pub fn guard_page() -> Self {
        Page::new(PageAttr::empty(), PageBody::zeroed())
    }

    pub fn is_owning(&self) -> bool {
        self.body.is_owning()
    }

    pub fn data(&self) -> &[u8] {
        self.body.as_slice()
    }

    /// Mutable access to page bytes. Callers must have already established
    /// the page is writable (or mid-CoW-resolution); this does not check
    /// `attr.write` itself.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        if !self.body.is_owning() {
            self.body = self.body.to_owned_copy();
        }
        match &mut self.body {
            PageBody::Owned(buf) => Arc::make_mut(buf),
            PageBody::Borrowed { .. } => unreachable!("just materialized an owned copy"),
        }
    }

    /// Clone the page's bytes into a brand new owned buffer (used to resolve
    /// CoW writes and to implement fork's full-copy fallback).
    pub fn clone_owned(&self) -> Page {
        Page::new(self.attr, self.body.to_owned_copy())
    }

    /// Convert this page into a CoW-shared one backed by a freshly-promoted
    /// `Arc<Vec<u8>>`, returning the body a fork child should install at the
    /// same page number. Both parent and child end up non-owning and
    /// `COW`-flagged, pointing at the same backing storage; the first write
    /// on either side materializes a private copy (`Page::data_mut`).
    pub fn share_cow(&mut self) -> (PageAttr, PageBody) {
        if let PageBody::Owned(_) = &self.body {
            let backing = Arc::new(self.body.as_slice().to_vec());
            self.body = PageBody::Borrowed { backing, offset: 0 };
        }
        self.attr.insert(PageAttr::COW);
        (self.attr, self.body.clone())
    }

    pub fn has_trap(&self) -> bool {
        self.trap.is_some()
    }

    /// Install (or clear, with `None`) a trap callback. Setting a trap
    /// forces the page uncacheable; clearing one restores cacheability,
    /// matching spec.md §4.1.
    pub fn set_trap(&mut self, cb: Option<TrapCallback>) {
        self.attr.set(PageAttr::CACHEABLE, cb.is_none());
        self.trap = cb;
    }

    pub fn fire_trap(&self, event: TrapEvent) {
        if let Some(cb) = &self.trap {
            (cb.lock().unwrap())(event);
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("attr", &self.attr)
            .field("owning", &self.is_owning())
            .field("has_trap", &self.has_trap())
            .finish()
    }
}
