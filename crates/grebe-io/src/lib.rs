//! Binary matrix serialization.
//!
//! Fixed little-endian layout: a header
//! `(magic, version, orientation, hyper, type_code, type_size, nrows,
//! ncols, nvec, nvals)` followed by the `p`, optional `h`, `i`, and `x`
//! arrays. Only finalized matrices serialize (pending tuples and zombies
//! are a transient in-memory state, not part of the wire form), and every
//! deserialized payload passes the full structural invariant check before
//! it becomes a matrix.

use grebe_core::{Error, Matrix, Orientation, Result, Type, TypeCode};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const MAGIC: u32 = 0x4752_4245; // "GRBE"
const FORMAT_VERSION: u32 = 1;

/// Serialize a finalized matrix into a byte vector.
pub fn serialize_matrix(m: &Matrix) -> Result<Vec<u8>> {
    if !m.is_finalized() {
        return Err(Error::InvalidObject(
            "matrix has deferred work; call wait before serializing".into(),
        ));
    }
    let nvec = m.nvec();
    let nvals = m.nstored();
    let mut out = Vec::with_capacity(58 + (nvec + 1 + nvals) * 8 + m.x.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(match m.orientation {
        Orientation::ByCol => 0,
        Orientation::ByRow => 1,
    });
    out.push(u8::from(m.is_hyper()));
    out.push(m.typ.code as u8);
    out.extend_from_slice(&(m.typ.size as u64).to_le_bytes());
    out.extend_from_slice(&(m.nrows as u64).to_le_bytes());
    out.extend_from_slice(&(m.ncols as u64).to_le_bytes());
    out.extend_from_slice(&(nvec as u64).to_le_bytes());
    out.extend_from_slice(&(nvals as u64).to_le_bytes());
    for &v in &m.p {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(h) = &m.h {
        for &v in h {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    for &v in &m.i {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&m.x);
    Ok(out)
}

/// Reconstruct a matrix, validating the header and every structural
/// invariant.
pub fn deserialize_matrix(bytes: &[u8]) -> Result<Matrix> {
    let mut r = Reader { bytes, pos: 0 };
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(Error::InvalidObject(format!("bad magic 0x{magic:08x}")));
    }
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(Error::InvalidObject(format!(
            "unsupported format version {version}"
        )));
    }
    let orientation = match r.u8()? {
        0 => Orientation::ByCol,
        1 => Orientation::ByRow,
        other => {
            return Err(Error::InvalidObject(format!(
                "bad orientation byte {other}"
            )))
        }
    };
    let hyper = match r.u8()? {
        0 => false,
        1 => true,
        other => return Err(Error::InvalidObject(format!("bad hyper byte {other}"))),
    };
    let code = r.u8()?;
    let code = TypeCode::from_u8(code)
        .ok_or_else(|| Error::InvalidObject(format!("bad type code {code}")))?;
    let type_size = r.usize64()?;
    let typ = match Type::builtin(code) {
        Some(t) => {
            if t.size != type_size {
                return Err(Error::InvalidObject(format!(
                    "type {code:?} has size {}, header says {type_size}",
                    t.size
                )));
            }
            t
        }
        None => {
            if type_size == 0 {
                return Err(Error::InvalidObject("user type with zero size".into()));
            }
            Type::user(type_size)
        }
    };
    let nrows = r.usize64()?;
    let ncols = r.usize64()?;
    let nvec = r.usize64()?;
    let nvals = r.usize64()?;

    let p = r.i64_array(nvec + 1)?;
    let h = if hyper { Some(r.i64_array(nvec)?) } else { None };
    let i = r.i64_array(nvals)?;
    let x = r.take(nvals.checked_mul(typ.size).ok_or_else(|| {
        Error::InvalidObject("value array size overflow".into())
    })?)?;
    if r.pos != bytes.len() {
        return Err(Error::InvalidObject(format!(
            "{} trailing bytes after payload",
            bytes.len() - r.pos
        )));
    }
    Matrix::from_parts(typ, nrows, ncols, orientation, h, p, i, x.to_vec(), true)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| Error::InvalidObject("truncated payload".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    fn usize64(&mut self) -> Result<usize> {
        let b = self.take(8)?;
        let v = u64::from_le_bytes(b.try_into().expect("8 bytes"));
        usize::try_from(v).map_err(|_| Error::InvalidObject("size exceeds address space".into()))
    }

    fn i64_array(&mut self, n: usize) -> Result<Vec<i64>> {
        let b = self.take(n.checked_mul(8).ok_or_else(|| {
            Error::InvalidObject("index array size overflow".into())
        })?)?;
        Ok(b.chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().expect("8 bytes")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grebe_core::Context;
    use grebe_kernels::{matrix_from_tuples, wait};

    #[test]
    fn round_trip_by_column() {
        let m = matrix_from_tuples::<f64>(
            3,
            3,
            Orientation::ByCol,
            &[(0, 0, 1.5), (2, 0, -2.0), (1, 2, 4.25)],
        )
        .unwrap();
        let bytes = serialize_matrix(&m).unwrap();
        let back = deserialize_matrix(&bytes).unwrap();
        assert_eq!(back.orientation, Orientation::ByCol);
        assert_eq!((back.nrows, back.ncols), (3, 3));
        assert_eq!(back.nvals(), 3);
        assert_eq!(back.get_entry::<f64>(2, 0), Some(-2.0));
        assert_eq!(back.get_entry::<f64>(1, 2), Some(4.25));
    }

    #[test]
    fn round_trip_hypersparse() {
        let m = matrix_from_tuples::<i32>(4, 500, Orientation::ByCol, &[(1, 7, 9), (3, 400, -1)])
            .unwrap();
        assert!(m.is_hyper());
        let bytes = serialize_matrix(&m).unwrap();
        let back = deserialize_matrix(&bytes).unwrap();
        assert!(back.is_hyper());
        assert_eq!(back.get_entry::<i32>(3, 400), Some(-1));
    }

    #[test]
    fn unfinalized_matrix_is_rejected() {
        let mut m = Matrix::new(Type::FP64, 2, 2).unwrap();
        m.set_element(0, 0, 1.0f64).unwrap();
        assert!(matches!(
            serialize_matrix(&m),
            Err(Error::InvalidObject(_))
        ));
        wait(&mut m, &Context::new()).unwrap();
        assert!(serialize_matrix(&m).is_ok());
    }

    #[test]
    fn corrupted_payloads_are_rejected() {
        let m = matrix_from_tuples::<i32>(2, 2, Orientation::ByCol, &[(0, 1, 3)]).unwrap();
        let mut bytes = serialize_matrix(&m).unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xff;
        assert!(deserialize_matrix(&bad_magic).is_err());

        // truncation
        bytes.truncate(bytes.len() - 1);
        assert!(deserialize_matrix(&bytes).is_err());
    }

    #[test]
    fn unsorted_indices_fail_the_invariant_check() {
        let m = matrix_from_tuples::<i32>(3, 1, Orientation::ByCol, &[(0, 0, 1), (2, 0, 2)])
            .unwrap();
        let mut bytes = serialize_matrix(&m).unwrap();
        // swap the two row indices in place
        let idx_off = bytes.len() - 2 * 4 - 2 * 8;
        let (a, b) = (idx_off, idx_off + 8);
        for k in 0..8 {
            bytes.swap(a + k, b + k);
        }
        assert!(matches!(
            deserialize_matrix(&bytes),
            Err(Error::InvalidObject(_))
        ));
    }
}
