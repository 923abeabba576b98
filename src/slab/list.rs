//! Intrusive-style slab lists keyed by slab address
//!
//! A slab heap keeps every slab it owns on exactly one list. Links live in
//! a side table keyed by the slab's base pointer, so moving a slab between
//! lists is O(1) and needs no pointer into the slab itself.

use crate::region::RPtr;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Link {
    list: usize,
    prev: Option<RPtr>,
    next: Option<RPtr>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ends {
    head: Option<RPtr>,
    tail: Option<RPtr>,
    len: usize,
}

/// A fixed number of doubly-linked lists of slabs
#[derive(Debug, Clone)]
pub struct SlabLists {
    ends: Vec<Ends>,
    links: HashMap<RPtr, Link>,
}

impl SlabLists {
    pub fn new(nlists: usize) -> Self {
        Self {
            ends: vec![Ends::default(); nlists],
            links: HashMap::new(),
        }
    }

    /// Link `slab` at the head of `list`
    ///
    /// Panics if the slab is already on a list.
    pub fn push_front(&mut self, list: usize, slab: RPtr) {
        assert!(!self.links.contains_key(&slab), "slab {} is already listed", slab);
        let ends = &mut self.ends[list];
        let old_head = ends.head;
        ends.head = Some(slab);
        if ends.tail.is_none() {
            ends.tail = Some(slab);
        }
        ends.len += 1;
        if let Some(old_head) = old_head {
            if let Some(link) = self.links.get_mut(&old_head) {
                link.prev = Some(slab);
            }
        }
        self.links.insert(
            slab,
            Link {
                list,
                prev: None,
                next: old_head,
            },
        );
    }

    /// Unlink `slab`, returning the list it was on
    pub fn remove(&mut self, slab: RPtr) -> Option<usize> {
        let link = self.links.remove(&slab)?;
        match link.prev {
            Some(prev) => {
                if let Some(prev) = self.links.get_mut(&prev) {
                    prev.next = link.next;
                }
            }
            None => self.ends[link.list].head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(next) = self.links.get_mut(&next) {
                    next.prev = link.prev;
                }
            }
            None => self.ends[link.list].tail = link.prev,
        }
        self.ends[link.list].len -= 1;
        Some(link.list)
    }

    pub fn front(&self, list: usize) -> Option<RPtr> {
        self.ends[list].head
    }

    /// Number of slabs on `list`
    pub fn len(&self, list: usize) -> usize {
        self.ends[list].len
    }

    /// Number of slabs across all lists
    pub fn total(&self) -> usize {
        self.links.len()
    }

    /// List holding `slab`
    pub fn list_of(&self, slab: RPtr) -> Option<usize> {
        self.links.get(&slab).map(|link| link.list)
    }

    /// Slabs on `list`, head first
    pub fn iter(&self, list: usize) -> impl Iterator<Item = RPtr> + '_ {
        std::iter::successors(self.ends[list].head, move |slab| {
            self.links.get(slab).and_then(|link| link.next)
        })
    }

    /// Every listed slab, in no particular order
    pub fn slabs(&self) -> impl Iterator<Item = RPtr> + '_ {
        self.links.keys().copied()
    }
}
