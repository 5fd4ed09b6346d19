mod minheap;
pub use minheap::MinHeap;
