//! Double-buffered column with swappable READ/WRITE roles.
//!
//! A stage writes into the WRITE side while downstream consumers keep
//! reading the READ side. [`DoubleBuffer::swap`] publishes the staged
//! values by exchanging the two sides in place: no element is copied.

use std::mem;

use crate::column::{Column, ColumnLayout, HostColumn};

/// Two columns of identical layout and length.
///
/// ```text
/// read:  HostColumn  ←─── authoritative, consumed by later stages
/// write: HostColumn  ←─── staging, filled by the current stage
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct DoubleBuffer {
    read: HostColumn,
    write: HostColumn,
    /// Number of swaps performed. Odd means the sides are exchanged
    /// relative to construction.
    swaps: u64,
}

impl DoubleBuffer {
    /// Both sides zero-filled.
    pub fn zeroed(layout: ColumnLayout, len: usize) -> Self {
        Self {
            read: HostColumn::zeroed(layout, len),
            write: HostColumn::zeroed(layout, len),
            swaps: 0,
        }
    }

    /// Wrap existing data as the READ side; the WRITE side starts zeroed.
    pub fn from_read(read: HostColumn) -> Self {
        let write = HostColumn::zeroed(read.layout(), read.len());
        Self {
            read,
            write,
            swaps: 0,
        }
    }

    /// The authoritative side.
    pub fn read(&self) -> &HostColumn {
        &self.read
    }

    /// Mutable access to the authoritative side.
    ///
    /// Used by host-side loaders and by dumps from devices; stages
    /// normally write into [`write_mut`](Self::write_mut).
    pub fn read_mut(&mut self) -> &mut HostColumn {
        &mut self.read
    }

    /// The staging side.
    pub fn write(&self) -> &HostColumn {
        &self.write
    }

    /// Mutable access to the staging side.
    pub fn write_mut(&mut self) -> &mut HostColumn {
        &mut self.write
    }

    /// Split borrow: READ immutably, WRITE mutably.
    pub fn split(&mut self) -> (&HostColumn, &mut HostColumn) {
        (&self.read, &mut self.write)
    }

    /// Exchange the roles of the two sides.
    pub fn swap(&mut self) {
        mem::swap(&mut self.read, &mut self.write);
        self.swaps += 1;
    }

    /// Number of role swaps so far.
    pub fn swap_count(&self) -> u64 {
        self.swaps
    }

    /// Element layout shared by both sides.
    pub fn layout(&self) -> ColumnLayout {
        self.read.layout()
    }
}

impl Column for DoubleBuffer {
    fn len(&self) -> usize {
        self.read.len()
    }

    fn swap_elements(&mut self, i: usize, j: usize) {
        self.read.swap_elements(i, j);
        self.write.swap_elements(i, j);
    }

    fn resize(&mut self, len: usize) {
        self.read.resize(len);
        self.write.resize(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged() -> DoubleBuffer {
        let mut buf = DoubleBuffer::from_read(HostColumn::Float(vec![1.0, 2.0]));
        if let Some(w) = buf.write_mut().as_float_mut() {
            w.copy_from_slice(&[10.0, 20.0]);
        }
        buf
    }

    #[test]
    fn swap_publishes_staged_values() {
        let mut buf = staged();
        assert_eq!(buf.read().as_float(), Some(&[1.0, 2.0][..]));
        buf.swap();
        assert_eq!(buf.read().as_float(), Some(&[10.0, 20.0][..]));
        assert_eq!(buf.write().as_float(), Some(&[1.0, 2.0][..]));
        assert_eq!(buf.swap_count(), 1);
    }

    #[test]
    fn double_swap_restores_roles() {
        let mut buf = staged();
        let before = buf.clone();
        buf.swap();
        buf.swap();
        assert_eq!(buf.read(), before.read());
        assert_eq!(buf.write(), before.write());
    }

    #[test]
    fn element_swap_applies_to_both_sides() {
        let mut buf = staged();
        buf.swap_elements(0, 1);
        assert_eq!(buf.read().as_float(), Some(&[2.0, 1.0][..]));
        assert_eq!(buf.write().as_float(), Some(&[20.0, 10.0][..]));
    }

    #[test]
    fn split_allows_read_to_write_stage() {
        let mut buf = staged();
        let (read, write) = buf.split();
        let src = read.as_float().unwrap();
        let dst = write.as_float_mut().unwrap();
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s * 3.0;
        }
        buf.swap();
        assert_eq!(buf.read().as_float(), Some(&[3.0, 6.0][..]));
    }

    #[test]
    fn resize_keeps_sides_aligned() {
        let mut buf = staged();
        buf.resize(5);
        assert_eq!(buf.read().len(), 5);
        assert_eq!(buf.write().len(), 5);
    }
}
