use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub struct MinHeap<T: Ord>(BinaryHeap<Reverse<T>>);

impl<T: Ord> MinHeap<T> {
  pub fn new() -> Self {
    MinHeap(BinaryHeap::<Reverse<T>>::new())
  }

  pub fn push(&mut self, item: T) {
    self.0.push(Reverse(item));
  }

  pub fn pop(&mut self) -> Option<T> {
    self.0.pop().map(|v| v.0)
  }
}

impl<T: Ord> Default for MinHeap<T> {
  fn default() -> Self {
    MinHeap::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minheap() {
    let mut heap = MinHeap::new();
    heap.push(3);
    heap.push(1);
    heap.push(2);
    heap.push(0);
    assert_eq!(
      std::iter::from_fn(|| heap.pop()).collect::<Vec<_>>(),
      vec![0, 1, 2, 3]
    );
    assert_eq!(heap.pop(), None);
  }

  #[test]
  fn test_minheap_tuples() {
    let mut heap = MinHeap::new();
    heap.push((7, 2));
    heap.push((7, 1));
    heap.push((3, 9));
    assert_eq!(heap.pop(), Some((3, 9)));
    assert_eq!(heap.pop(), Some((7, 1)));
  }
}
