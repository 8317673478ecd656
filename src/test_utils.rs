//! Sample frames shared by unit tests and benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use bytes::{Bytes, BytesMut};

use crate::frame::{DataFrame, Frame, Tag, TypedFrame};

/// A data frame whose carriage is `size` bytes of a repeating pattern.
pub fn sample_data_frame(tag: Tag, size: usize) -> DataFrame {
    let carriage: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    DataFrame::new("6f9619ff-8b86-d011-b42d-00c04fc964ff", "1", tag, Bytes::from(carriage))
}

/// [`sample_data_frame`] as an encoded-ready [`Frame`].
pub fn sample_frame(tag: Tag, size: usize) -> Frame {
    match sample_data_frame(tag, size).to_frame() {
        Ok(frame) => frame,
        Err(e) => panic!("sample frame of {size} bytes does not fit: {e}"),
    }
}

/// `count` sample frames written back to back, as they arrive on a stream.
pub fn encoded_batch(count: usize, size: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    for i in 0..count {
        if let Err(e) = sample_frame(i as Tag, size).encode_into(&mut buf) {
            panic!("failed to encode sample frame: {e}");
        }
    }
    buf
}
