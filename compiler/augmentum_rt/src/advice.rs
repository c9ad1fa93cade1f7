//! Singly-linked advice chains.
//!
//! Each extension point keeps three of these, one per advice kind. Nodes
//! are pushed at the front, so iteration order is most-recent-first, and
//! the raw node pointer doubles as the opaque handle returned at attach
//! time. For around advice, "previous in the chain" is simply the `next`
//! node, which is what gives the most recently attached advice the
//! outermost frame.
//!
//! Removal is O(n). Chains are expected to stay shallow (typically under
//! ten entries), so a singly-linked walk beats paying the space cost of
//! back links.

use std::ffi::c_void;
use std::ptr;

use crate::AdviceId;

pub(crate) struct Node<F> {
    pub(crate) advice: F,
    pub(crate) id: AdviceId,
    pub(crate) next: *mut Node<F>,
}

pub(crate) struct AdviceList<F> {
    head: *mut Node<F>,
}

impl<F> AdviceList<F> {
    pub(crate) const fn new() -> Self {
        AdviceList {
            head: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn head(&self) -> *mut Node<F> {
        self.head
    }

    /// Push a new node at the front and return it as an opaque handle.
    pub(crate) fn push_front(&mut self, advice: F, id: AdviceId) -> *mut c_void {
        let node = Box::into_raw(Box::new(Node {
            advice,
            id,
            next: self.head,
        }));
        self.head = node;
        node.cast()
    }

    /// Unlink and free the node behind `handle`. A handle that is not in
    /// the list is ignored.
    pub(crate) fn erase(&mut self, handle: *mut c_void) {
        let target: *mut Node<F> = handle.cast();
        let mut prev: *mut Node<F> = ptr::null_mut();
        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: curr came from Box::into_raw and has not been freed.
            let next = unsafe { (*curr).next };
            if curr == target {
                if prev.is_null() {
                    self.head = next;
                } else {
                    // SAFETY: prev is a live node of this list.
                    unsafe { (*prev).next = next };
                }
                // SAFETY: curr is unlinked; reclaim it.
                drop(unsafe { Box::from_raw(curr) });
                return;
            }
            prev = curr;
            curr = next;
        }
    }

    /// Unlink and free every node carrying `id`.
    pub(crate) fn remove_id(&mut self, id: AdviceId) {
        debug_assert!(id != 0, "id 0 never matches and is rejected upstream");
        let mut prev: *mut Node<F> = ptr::null_mut();
        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: curr is a live node of this list.
            let next = unsafe { (*curr).next };
            if unsafe { (*curr).id } == id {
                if prev.is_null() {
                    self.head = next;
                } else {
                    // SAFETY: prev is a live node of this list.
                    unsafe { (*prev).next = next };
                }
                // SAFETY: curr is unlinked; reclaim it.
                drop(unsafe { Box::from_raw(curr) });
            } else {
                prev = curr;
            }
            curr = next;
        }
    }

    /// Iterate raw node pointers in stored (most-recent-first) order.
    ///
    /// The caller must not mutate the list while iterating; attach/detach
    /// during evaluation is outside the supported contract.
    pub(crate) fn iter_nodes(&self) -> NodeIter<F> {
        NodeIter { curr: self.head }
    }
}

impl<F> Drop for AdviceList<F> {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // SAFETY: every node was allocated with Box::into_raw and is
            // owned by this list.
            let next = unsafe { (*curr).next };
            drop(unsafe { Box::from_raw(curr) });
            curr = next;
        }
        self.head = ptr::null_mut();
    }
}

pub(crate) struct NodeIter<F> {
    curr: *mut Node<F>,
}

impl<F> Iterator for NodeIter<F> {
    type Item = *mut Node<F>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr.is_null() {
            return None;
        }
        let node = self.curr;
        // SAFETY: node is a live node; see iter_nodes contract.
        self.curr = unsafe { (*node).next };
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_front_orders_most_recent_first() {
        let mut list: AdviceList<u32> = AdviceList::new();
        list.push_front(10, 1);
        list.push_front(20, 2);
        let values: Vec<u32> = list
            .iter_nodes()
            .map(|n| unsafe { (*n).advice })
            .collect();
        assert_eq!(values, vec![20, 10]);
    }

    #[test]
    fn test_erase_by_handle() {
        let mut list: AdviceList<u32> = AdviceList::new();
        let h1 = list.push_front(1, 0);
        let h2 = list.push_front(2, 0);
        list.erase(h1);
        let values: Vec<u32> = list
            .iter_nodes()
            .map(|n| unsafe { (*n).advice })
            .collect();
        assert_eq!(values, vec![2]);
        list.erase(h2);
        assert!(list.is_empty());
        // Stale handle on an empty list is ignored.
        list.erase(h2);
    }

    #[test]
    fn test_remove_id_removes_all_matches() {
        let mut list: AdviceList<u32> = AdviceList::new();
        list.push_front(1, 7);
        list.push_front(2, 9);
        list.push_front(3, 7);
        list.push_front(4, 7);
        list.remove_id(7);
        let values: Vec<u32> = list
            .iter_nodes()
            .map(|n| unsafe { (*n).advice })
            .collect();
        assert_eq!(values, vec![2]);
    }

    #[test]
    fn test_previous_is_next_node() {
        let mut list: AdviceList<u32> = AdviceList::new();
        let h_old = list.push_front(1, 0);
        let h_new = list.push_front(2, 0);
        let head = list.head();
        assert_eq!(head.cast(), h_new);
        assert_eq!(unsafe { (*head).next }.cast(), h_old);
    }
}
