//! Lock-free append-only set, the sink reduce kernels emit into.
//!
//! A singly-linked list of fixed-size elements with one spare node always
//! "in hand" at the tail: appending swaps the spare for a fresh one with a
//! single compare-and-exchange, which hands the appender exclusive
//! ownership of the old tail node to fill in. Elements are never removed
//! and iteration stops at the in-hand sentinel, so an element is visible to
//! iterators exactly once its node's `next` pointer is published.

use std::alloc::{alloc, dealloc, Layout};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[repr(C)]
struct Node {
    next: AtomicPtr<Node>,
    // Element bytes are stored immediately after the header.
}

const DATA_OFFSET: usize = std::mem::size_of::<Node>();

pub struct LockFreeSet {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    element_size: usize,
    count: AtomicUsize,
}

unsafe impl Send for LockFreeSet {}
unsafe impl Sync for LockFreeSet {}

impl LockFreeSet {
    fn node_layout(element_size: usize) -> Layout {
        Layout::from_size_align(DATA_OFFSET + element_size, std::mem::align_of::<Node>())
            .expect("element size overflow")
    }

    fn new_node(element_size: usize) -> *mut Node {
        unsafe {
            let node = alloc(Self::node_layout(element_size)) as *mut Node;
            assert!(!node.is_null(), "lock-free set allocation failed");
            (*node).next = AtomicPtr::new(std::ptr::null_mut());
            node
        }
    }

    /// Create a set holding elements of `element_size` bytes.
    pub fn new(element_size: usize) -> LockFreeSet {
        assert!(element_size > 0);
        // One node is kept in hand to copy into; this keeps the CAS simple.
        let node = Self::new_node(element_size);
        LockFreeSet {
            head: AtomicPtr::new(node),
            tail: AtomicPtr::new(node),
            element_size,
            count: AtomicUsize::new(0),
        }
    }

    /// Create a set sized for `T` elements.
    pub fn for_element<T: bytemuck::Pod>() -> LockFreeSet {
        LockFreeSet::new(std::mem::size_of::<T>())
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of elements inserted so far. Monotonic.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one element. Safe to call from any number of threads.
    pub fn insert_bytes(&self, element: &[u8]) {
        assert_eq!(element.len(), self.element_size);
        unsafe { self.insert_raw(element.as_ptr()) }
    }

    pub fn insert<T: bytemuck::Pod>(&self, element: &T) {
        self.insert_bytes(bytemuck::bytes_of(element));
    }

    /// # Safety
    /// `element` must point at `element_size` readable bytes.
    pub(crate) unsafe fn insert_raw(&self, element: *const u8) {
        // Fresh node to leave in hand for the next caller.
        let new_node = Self::new_node(self.element_size);

        // Swap it for the current tail; the old tail is then exclusively
        // ours to fill.
        let mut old_tail = self.tail.load(Ordering::Acquire);
        loop {
            match self
                .tail
                .compare_exchange_weak(old_tail, new_node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => old_tail = current,
            }
        }

        // Element bytes must be in place before the node is published by
        // the `next` store below.
        let data = (old_tail as *mut u8).add(DATA_OFFSET);
        std::ptr::copy_nonoverlapping(element, data, self.element_size);
        (*old_tail).next.store(new_node, Ordering::Release);

        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Iterate over the elements inserted so far, in list order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            node: self.head.load(Ordering::Acquire),
            element_size: self.element_size,
            _marker: PhantomData,
        }
    }

    /// Typed iteration; `T` must match the element size.
    pub fn iter_as<T: bytemuck::Pod>(&self) -> impl Iterator<Item = &T> {
        assert_eq!(std::mem::size_of::<T>(), self.element_size);
        self.iter().map(|bytes| bytemuck::from_bytes(bytes))
    }
}

impl Drop for LockFreeSet {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        let layout = Self::node_layout(self.element_size);
        while !node.is_null() {
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            unsafe { dealloc(node as *mut u8, layout) };
            node = next;
        }
    }
}

pub struct Iter<'a> {
    node: *mut Node,
    element_size: usize,
    _marker: PhantomData<&'a LockFreeSet>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.node.is_null() {
            return None;
        }
        // The in-hand tail node has no successor and holds no element yet.
        let next = unsafe { (*self.node).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        let data = unsafe {
            std::slice::from_raw_parts((self.node as *const u8).add(DATA_OFFSET), self.element_size)
        };
        self.node = next;
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn inserted_elements_are_reachable() {
        let set = LockFreeSet::for_element::<[f32; 2]>();
        set.insert(&[1.0f32, 2.0]);
        set.insert(&[3.0f32, 4.0]);
        assert_eq!(set.len(), 2);
        let items: Vec<[f32; 2]> = set.iter_as::<[f32; 2]>().copied().collect();
        assert_eq!(items, vec![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn empty_set_iterates_nothing() {
        let set = LockFreeSet::new(8);
        assert!(set.is_empty());
        assert_eq!(set.iter().count(), 0);
    }

    // Property: N appends from T threads leave exactly N reachable
    // elements, each one intact.
    #[test]
    fn concurrent_appends_all_visible() {
        let set = Arc::new(LockFreeSet::for_element::<u64>());
        let threads = 8;
        let per_thread = 1000u64;
        let mut handles = Vec::new();
        for t in 0..threads {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..per_thread {
                    set.insert(&(t as u64 * per_thread + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.len(), (threads as u64 * per_thread) as usize);
        let mut seen: Vec<u64> = set.iter_as::<u64>().copied().collect();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..threads as u64 * per_thread).collect();
        assert_eq!(seen, expected);
    }
}
