//! Byte-range addressing into memory-mapped safetensors files

use super::DType;
use memmap2::Mmap;
use std::path::Path;

/// Location of one tensor's payload inside its file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpan {
    /// Tensor name from the header
    pub name: String,
    /// Element format
    pub dtype: DType,
    /// Shape, outermost dimension first
    pub shape: Vec<usize>,
    /// Absolute byte offset of the payload from the start of the file
    pub offset: u64,
    /// Payload length in bytes
    pub nbytes: u64,
}

/// Memory-map a safetensors file and record every tensor's byte span,
/// sorted by offset. The map is dropped once the header is indexed.
pub fn index_safetensors(path: &Path) -> crate::Result<Vec<TensorSpan>> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    let header = safetensors::SafeTensors::deserialize(&mmap)?;
    let base = mmap.as_ptr() as usize;
    let mut spans = Vec::new();
    for (name, view) in header.tensors() {
        let dtype = DType::from_safetensors(&format!("{:?}", view.dtype()))
            .ok_or_else(|| crate::Error::UnsupportedDType(format!("{:?}", view.dtype())))?;
        let data = view.data();
        // Payload slices borrow straight from the map, so the
        // pointer distance is the absolute file position.
        let offset = (data.as_ptr() as usize - base) as u64;
        spans.push(TensorSpan {
            name,
            dtype,
            shape: view.shape().to_vec(),
            offset,
            nbytes: data.len() as u64,
        });
    }
    spans.sort_by_key(|s| s.offset);
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_offsets_are_absolute_file_positions() {
        let header = br#"{"a":{"dtype":"U8","shape":[2,4],"data_offsets":[0,8]},"b":{"dtype":"F16","shape":[2],"data_offsets":[8,12]}}"#;
        let mut header = header.to_vec();
        while header.len() % 8 != 0 {
            header.push(b' ');
        }
        let payload: Vec<u8> = (0..12).collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.safetensors");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(&header).unwrap();
        file.write_all(&payload).unwrap();
        drop(file);

        let spans = index_safetensors(&path).unwrap();
        let data_start = 8 + header.len() as u64;
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].name, "a");
        assert_eq!(spans[0].offset, data_start);
        assert_eq!(spans[1].offset, data_start + 8);
        assert_eq!(spans[1].dtype, DType::F16);

        let raw = std::fs::read(&path).unwrap();
        let b = &spans[1];
        let start = b.offset as usize;
        assert_eq!(&raw[start..start + b.nbytes as usize], &payload[8..12]);
    }
}
