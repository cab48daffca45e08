use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Intrusive doubly linked list. Nodes are written into memory the pool already
/// owns (the first bytes of every block), the list itself never allocates.
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

/// Iterator over the raw nodes of a [`List`]. The next link is read before the
/// node is yielded, so the caller may give the node's memory back while iterating.
pub(crate) struct Nodes<T> {
    current: Link<Node<T>>,
    remaining: usize,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    /// Appends a new node to the list.
    ///
    /// Because we are the allocator, this method can not make allocations
    /// itself. It receives the `addr` where the node has to be written, which is
    /// always the start of a block region.
    ///
    /// **SAFETY**: Caller must guarantee that `addr` is valid for writes of a
    /// `Node<T>`, suitably aligned and not part of another live node.
    pub unsafe fn append(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            node.as_ptr().write(Node {
                next: None,
                prev: self.tail,
                data,
            });

            if let Some(mut tail) = self.tail {
                tail.as_mut().next = Some(node);
            } else {
                self.head = Some(node);
            }
        }

        self.tail = Some(node);
        self.len += 1;

        node
    }

    /// Unlinks `node` from the list. The node's memory is left untouched apart
    /// from its links, which are cleared.
    ///
    /// **SAFETY**: `node` must be a member of this list.
    pub unsafe fn remove(&mut self, mut node: NonNull<Node<T>>) {
        unsafe {
            let prev = node.as_ref().prev;
            let next = node.as_ref().next;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }

            node.as_mut().prev = None;
            node.as_mut().next = None;
        }

        self.len -= 1;
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }

    pub fn nodes(&self) -> Nodes<T> {
        Nodes {
            current: self.head,
            remaining: self.len,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
            self.remaining -= 1;

            Some(&node.as_ref().data)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> Iterator for Nodes<T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn slot<T>(storage: &mut MaybeUninit<Node<T>>) -> NonNull<u8> {
        NonNull::from(storage).cast()
    }

    fn values(list: &List<u32>) -> Vec<u32> {
        list.iter().copied().collect()
    }

    #[test]
    fn new_list_is_empty() {
        let list: List<u8> = List::new();

        assert_eq!(list.len(), 0);
        assert!(list.iter().next().is_none());
        assert!(list.first().is_none());
        assert!(list.tail.is_none());
    }

    #[test]
    fn append_keeps_order() {
        let mut storage: [MaybeUninit<Node<u32>>; 3] = [const { MaybeUninit::uninit() }; 3];
        let mut list = List::new();

        unsafe {
            for (i, s) in storage.iter_mut().enumerate() {
                list.append(i as u32, slot(s));
            }
        }

        assert_eq!(values(&list), vec![0, 1, 2]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.nodes().count(), 3);
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let mut storage: [MaybeUninit<Node<u32>>; 4] = [const { MaybeUninit::uninit() }; 4];
        let mut list = List::new();

        let nodes: Vec<_> = unsafe {
            storage
                .iter_mut()
                .enumerate()
                .map(|(i, s)| list.append(i as u32, slot(s)))
                .collect()
        };

        unsafe {
            list.remove(nodes[1]);
            assert_eq!(values(&list), vec![0, 2, 3]);

            list.remove(nodes[0]);
            assert_eq!(values(&list), vec![2, 3]);
            assert_eq!(list.first(), Some(nodes[2]));

            list.remove(nodes[3]);
            assert_eq!(values(&list), vec![2]);
            assert_eq!(list.tail, Some(nodes[2]));

            list.remove(nodes[2]);
        }

        assert_eq!(list.len(), 0);
        assert!(list.first().is_none());
        assert!(list.tail.is_none());
    }

    #[test]
    fn removed_node_can_be_appended_again() {
        let mut storage: [MaybeUninit<Node<u32>>; 3] = [const { MaybeUninit::uninit() }; 3];
        let mut list = List::new();

        let nodes: Vec<_> = unsafe {
            storage
                .iter_mut()
                .enumerate()
                .map(|(i, s)| list.append(i as u32, slot(s)))
                .collect()
        };

        unsafe {
            list.remove(nodes[1]);
            let again = list.append(7, nodes[1].cast());
            assert_eq!(again, nodes[1]);
        }

        assert_eq!(values(&list), vec![0, 2, 7]);
    }
}
