//! Self-describing binary stream used by weight persistence and the
//! distributed layer: little-endian i32, length-prefixed strings, and
//! tensors as rows/cols plus row-major f32 payload. Round-trips are
//! bit-exact.

use std::io::{Read, Write};

use crate::errors::{Error, Result};
use crate::tensor::Tensor;

/// Upper bound on a single decoded tensor (elements), guarding against
/// malformed streams.
const MAX_TENSOR_ELEMENTS: usize = 1 << 28;
const MAX_STRING_BYTES: usize = 1 << 24;

pub fn write_int<W: Write>(writer: &mut W, value: i32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_int<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    write_int(writer, value.len() as i32)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

pub fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_int(reader)?;
    if len < 0 || len as usize > MAX_STRING_BYTES {
        return Err(Error::Codec(format!("unreasonable string length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Codec(format!("invalid utf-8 string: {e}")))
}

pub fn write_tensor<W: Write>(writer: &mut W, tensor: &Tensor) -> Result<()> {
    write_int(writer, tensor.rows() as i32)?;
    write_int(writer, tensor.cols() as i32)?;
    for &v in tensor.as_slice() {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_tensor<R: Read>(reader: &mut R) -> Result<Tensor> {
    let rows = read_int(reader)?;
    let cols = read_int(reader)?;
    if rows < 0 || cols < 0 {
        return Err(Error::Codec(format!("negative tensor shape {rows}x{cols}")));
    }
    let (rows, cols) = (rows as usize, cols as usize);
    let count = rows.checked_mul(cols).filter(|&n| n <= MAX_TENSOR_ELEMENTS);
    let count = count.ok_or_else(|| Error::Codec(format!("unreasonable tensor shape {rows}x{cols}")))?;
    let mut values = Vec::with_capacity(count);
    let mut buf = [0u8; 4];
    for _ in 0..count {
        reader.read_exact(&mut buf)?;
        values.push(f32::from_le_bytes(buf));
    }
    Tensor::from_vec(rows, cols, values)
}

/// Serialize a variable set: count, then each tensor in insertion order.
pub fn encode_variables(tensors: &[Tensor]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_int(&mut out, tensors.len() as i32)?;
    for t in tensors {
        write_tensor(&mut out, t)?;
    }
    Ok(out)
}

pub fn decode_variables(bytes: &[u8]) -> Result<Vec<Tensor>> {
    let mut reader = bytes;
    let count = read_int(&mut reader)?;
    if count < 0 {
        return Err(Error::Codec(format!("negative variable count {count}")));
    }
    let mut tensors = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tensors.push(read_tensor(&mut reader)?);
    }
    if !reader.is_empty() {
        return Err(Error::Codec(format!(
            "{} trailing bytes after variable set",
            reader.len()
        )));
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        for v in [0, 1, -1, i32::MAX, i32::MIN, 123_456] {
            let mut buf = Vec::new();
            write_int(&mut buf, v).unwrap();
            assert_eq!(read_int(&mut buf.as_slice()).unwrap(), v);
        }
    }

    #[test]
    fn string_round_trip() {
        for s in ["", "weights", "δ-update"] {
            let mut buf = Vec::new();
            write_string(&mut buf, s).unwrap();
            assert_eq!(read_string(&mut buf.as_slice()).unwrap(), s);
        }
    }

    #[test]
    fn tensor_round_trip_is_bit_exact() {
        let t = Tensor::from_vec(
            2,
            3,
            vec![1.5, -2.25, 0.0, f32::MIN_POSITIVE, 3.9e8, -7.125],
        )
        .unwrap();
        let mut buf = Vec::new();
        write_tensor(&mut buf, &t).unwrap();
        let back = read_tensor(&mut buf.as_slice()).unwrap();
        assert_eq!(back.shape(), (2, 3));
        for (a, b) in t.as_slice().iter().zip(back.as_slice()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn variable_set_round_trip() {
        let a = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let bytes = encode_variables(&[a.clone(), b.clone()]).unwrap();
        let back = decode_variables(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back[0].is_approx(&a, 0.0));
        assert!(back[1].is_approx(&b, 0.0));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let t = Tensor::zeros(4, 4);
        let mut buf = Vec::new();
        write_tensor(&mut buf, &t).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_tensor(&mut buf.as_slice()).is_err());
    }
}
