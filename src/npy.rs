//! `.npy` arrays read lazily from disk.
//!
//! Only the header is parsed on [`NpyArray::open`]; [`NpyArray::index_select`]
//! seeks to and reads just the requested rows, so feature matrices larger than
//! memory can back a training run.

use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{matrix::DenseMatrix, Error, Result};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    fn parse(descr: &str) -> Result<Self> {
        match descr {
            "<f4" => Ok(DType::F32),
            "<f8" => Ok(DType::F64),
            "<i4" => Ok(DType::I32),
            "<i8" => Ok(DType::I64),
            other => Err(Error::Npy(format!("unsupported dtype '{other}'"))),
        }
    }

    pub fn word_size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    fn decode(&self, bytes: &[u8]) -> f64 {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        match self {
            DType::F32 => f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            DType::F64 => f64::from_le_bytes(buf),
            DType::I32 => i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            DType::I64 => i64::from_le_bytes(buf) as f64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NpyArray {
    path: PathBuf,
    dtype: DType,
    shape: Vec<usize>,
    prefix_len: u64,
}

impl NpyArray {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .map_err(|e| Error::Npy(format!("unable to open {}: {e}", path.display())))?;

        let mut preamble = [0u8; 8];
        file.read_exact(&mut preamble)?;
        if &preamble[..6] != MAGIC {
            return Err(Error::Npy(format!("{} is not an npy file", path.display())));
        }

        let (header_len, len_bytes) = match preamble[6] {
            1 => {
                let mut len = [0u8; 2];
                file.read_exact(&mut len)?;
                (u16::from_le_bytes(len) as usize, 2)
            }
            2 | 3 => {
                let mut len = [0u8; 4];
                file.read_exact(&mut len)?;
                (u32::from_le_bytes(len) as usize, 4)
            }
            v => return Err(Error::Npy(format!("unsupported format version {v}"))),
        };

        let mut header = vec![0u8; header_len];
        file.read_exact(&mut header)?;
        let header = String::from_utf8_lossy(&header);

        let (dtype, fortran_order, shape) = parse_header(&header)?;
        if fortran_order {
            return Err(Error::Npy(String::from("fortran-ordered arrays are not supported")));
        }

        Ok(Self {
            path,
            dtype,
            shape,
            prefix_len: (8 + len_bytes + header_len) as u64,
        })
    }

    pub fn feature_shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Number of scalars in one row, i.e. the product of the trailing dims.
    pub fn feature_dim(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    fn row_bytes(&self) -> usize {
        self.feature_dim() * self.dtype.word_size()
    }

    /// Reads the given rows straight from disk.
    pub fn index_select(&self, ids: &[usize]) -> Result<DenseMatrix> {
        let rows = self.num_rows();
        let dim = self.feature_dim();
        let row_bytes = self.row_bytes();
        let word = self.dtype.word_size();

        let mut file = File::open(&self.path)?;
        let mut buf = vec![0u8; row_bytes];
        let mut data = Vec::with_capacity(ids.len() * dim);

        for &id in ids {
            if id >= rows {
                return Err(Error::IndexOutOfBounds { index: id, len: rows });
            }
            file.seek(SeekFrom::Start(self.prefix_len + (id * row_bytes) as u64))?;
            file.read_exact(&mut buf)?;
            data.extend(buf.chunks_exact(word).map(|b| self.dtype.decode(b) as f32));
        }

        DenseMatrix::new(ids.len(), dim, data)
    }

    fn read_all(&self) -> Result<Vec<f64>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.prefix_len))?;

        let word = self.dtype.word_size();
        let len = self.shape.iter().product::<usize>();
        let mut bytes = vec![0u8; len * word];
        file.read_exact(&mut bytes)?;

        Ok(bytes
            .chunks_exact(word)
            .map(|b| self.dtype.decode(b))
            .collect())
    }
}

fn header_field<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let pattern = format!("'{key}':");
    let start = header
        .find(&pattern)
        .ok_or_else(|| Error::Npy(format!("header is missing '{key}'")))?;
    Ok(header[start + pattern.len()..].trim_start())
}

fn parse_header(header: &str) -> Result<(DType, bool, Vec<usize>)> {
    let descr = header_field(header, "descr")?;
    let descr = descr
        .strip_prefix('\'')
        .and_then(|rest| rest.split('\'').next())
        .ok_or_else(|| Error::Npy(String::from("malformed descr")))?;
    let dtype = DType::parse(descr)?;

    let fortran_order = header_field(header, "fortran_order")?.starts_with("True");

    let shape = header_field(header, "shape")?;
    let shape = shape
        .strip_prefix('(')
        .and_then(|rest| rest.split(')').next())
        .ok_or_else(|| Error::Npy(String::from("malformed shape")))?;
    let shape = shape
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| Error::Npy(format!("bad dimension '{s}'")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((dtype, fortran_order, shape))
}

/// Loads a whole array as a 2-d matrix; 1-d arrays become one column.
pub fn read_matrix(path: impl AsRef<Path>) -> Result<DenseMatrix> {
    let arr = NpyArray::open(path)?;
    let vals = arr.read_all()?;
    let cols = if arr.shape.len() <= 1 { 1 } else { arr.feature_dim() };
    DenseMatrix::new(arr.num_rows(), cols, vals.into_iter().map(|v| v as f32).collect())
}

/// Loads a flat array of non-negative integer ids.
pub fn read_indices(path: impl AsRef<Path>) -> Result<Vec<usize>> {
    let arr = NpyArray::open(path)?;
    if !matches!(arr.dtype, DType::I32 | DType::I64) {
        return Err(Error::Npy(format!("expected integer ids, found {:?}", arr.dtype)));
    }
    arr.read_all()?
        .into_iter()
        .map(|v| {
            if v < 0.0 {
                Err(Error::Npy(format!("negative id {v}")))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}

/// Loads a `2 x E` integer array as `(src, dst)`.
pub fn read_edges(path: impl AsRef<Path>) -> Result<(Vec<usize>, Vec<usize>)> {
    let path = path.as_ref();
    let shape = NpyArray::open(path)?.shape;
    if shape.len() != 2 || shape[0] != 2 {
        return Err(Error::Npy(format!("edges must have shape (2, E), found {shape:?}")));
    }
    let mut ids = read_indices(path)?;
    let dst = ids.split_off(shape[1]);
    Ok((ids, dst))
}

fn write_array(path: &Path, descr: &str, shape: &[usize], payload: &[u8]) -> Result<()> {
    let dims = match shape {
        [n] => format!("{n},"),
        _ => shape.iter().map(usize::to_string).collect::<Vec<_>>().join(", "),
    };
    let mut header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': ({dims}), }}");
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| Error::Npy(String::from("header too long")))?;

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    out.write_all(&[1, 0])?;
    out.write_all(&header_len.to_le_bytes())?;
    out.write_all(header.as_bytes())?;
    out.write_all(payload)?;
    out.flush()?;
    Ok(())
}

pub fn write_matrix(path: impl AsRef<Path>, m: &DenseMatrix) -> Result<()> {
    let payload = m
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect::<Vec<_>>();
    write_array(path.as_ref(), "<f4", &[m.rows(), m.cols()], &payload)
}

pub fn write_indices(path: impl AsRef<Path>, ids: &[i64], shape: &[usize]) -> Result<()> {
    if shape.iter().product::<usize>() != ids.len() {
        return Err(Error::ShapeMismatch(format!(
            "{} ids do not fill shape {shape:?}",
            ids.len()
        )));
    }
    let payload = ids.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
    write_array(path.as_ref(), "<i8", shape, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numpy_style_headers() {
        let (dtype, fortran, shape) =
            parse_header("{'descr': '<f4', 'fortran_order': False, 'shape': (3, 4), }").unwrap();
        assert_eq!(dtype, DType::F32);
        assert!(!fortran);
        assert_eq!(shape, vec![3, 4]);

        let (_, _, shape) =
            parse_header("{'descr': '<i8', 'fortran_order': False, 'shape': (7,), }").unwrap();
        assert_eq!(shape, vec![7]);

        assert!(parse_header("{'descr': '>f2', 'fortran_order': False, 'shape': (1,), }").is_err());
    }

    #[test]
    fn index_select_reads_only_requested_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feat.npy");
        let m = DenseMatrix::from_fn(5, 3, |r, c| (r * 10 + c) as f32);
        write_matrix(&path, &m).unwrap();

        let arr = NpyArray::open(&path).unwrap();
        assert_eq!(arr.feature_shape(), &[5, 3]);
        assert_eq!(arr.feature_dim(), 3);
        assert_eq!(arr.prefix_len % 64, 0);

        let rows = arr.index_select(&[4, 1]).unwrap();
        assert_eq!(rows.as_slice(), &[40.0, 41.0, 42.0, 10.0, 11.0, 12.0]);
        assert!(arr.index_select(&[5]).is_err());

        assert_eq!(read_matrix(&path).unwrap(), m);
    }

    #[test]
    fn edge_arrays_split_into_src_and_dst() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.npy");
        write_indices(&path, &[0, 1, 2, 1, 2, 0], &[2, 3]).unwrap();

        let (src, dst) = read_edges(&path).unwrap();
        assert_eq!(src, vec![0, 1, 2]);
        assert_eq!(dst, vec![1, 2, 0]);

        let flat = dir.path().join("ids.npy");
        write_indices(&flat, &[3, 1], &[2]).unwrap();
        assert_eq!(read_indices(&flat).unwrap(), vec![3, 1]);
        assert!(read_edges(&flat).is_err());
    }
}
