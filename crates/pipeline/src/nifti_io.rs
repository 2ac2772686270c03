//! NIfTI-1 volume backend
//!
//! Compact reader/writer for the subset of NIfTI-1 this pipeline touches:
//! 3D volumes, scalar and 16-bit label data, optional gzip compression,
//! endianness detected from `sizeof_hdr`. Written files are little-endian
//! with an sform affine taken from the volume geometry.

use crate::io::{resample_nearest_1mm, VolumeIo};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use cereb_seg_common::{Result, SegError, VolumeGeometry};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array3;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const MAGIC_OFFSET: usize = 344;

mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const SFORM_CODE: usize = 254;
    pub const SROW_X: usize = 280;
    pub const SROW_Y: usize = 296;
    pub const SROW_Z: usize = 312;
}

mod datatype {
    pub const UINT8: i16 = 2;
    pub const INT16: i16 = 4;
    pub const INT32: i16 = 8;
    pub const FLOAT32: i16 = 16;
    pub const FLOAT64: i16 = 64;
}

/// NIfTI-1 file backend for [`VolumeIo`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NiftiVolumeIo;

struct Header {
    little_endian: bool,
    shape: [usize; 3],
    datatype: i16,
    pixdim: [f32; 3],
    vox_offset: usize,
    scl_slope: f32,
    scl_inter: f32,
    srow: [[f32; 4]; 3],
}

fn is_gz(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("gz")
}

fn read_all(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| {
        SegError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot open {}: {e}", path.display()),
        ))
    })?;
    let mut bytes = Vec::new();
    if is_gz(path) {
        MultiGzDecoder::new(BufReader::new(file)).read_to_end(&mut bytes)?;
    } else {
        BufReader::new(file).read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

/// Read only the header bytes, without decompressing a whole `.gz` volume
fn read_header_bytes(path: &Path) -> Result<[u8; HEADER_SIZE]> {
    let file = File::open(path).map_err(|e| {
        SegError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot open {}: {e}", path.display()),
        ))
    })?;
    let mut bytes = [0u8; HEADER_SIZE];
    if is_gz(path) {
        MultiGzDecoder::new(BufReader::new(file)).read_exact(&mut bytes)?;
    } else {
        BufReader::new(file).read_exact(&mut bytes)?;
    }
    Ok(bytes)
}

fn parse_header(bytes: &[u8], path: &Path) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(SegError::Config(format!(
            "{} is too short for a NIfTI-1 header",
            path.display()
        )));
    }
    let sizeof_le = LittleEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]);
    let sizeof_be = BigEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]);
    let little_endian = match (sizeof_le, sizeof_be) {
        (348, _) => true,
        (_, 348) => false,
        _ => {
            return Err(SegError::Config(format!(
                "{} is not a NIfTI-1 file (sizeof_hdr != 348)",
                path.display()
            )))
        }
    };
    let magic = &bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4];
    if magic != b"n+1\0" && magic != b"ni1\0" {
        return Err(SegError::Config(format!(
            "{} has an unrecognized NIfTI magic",
            path.display()
        )));
    }

    let read_i16 = |offset: usize| -> i16 {
        if little_endian {
            LittleEndian::read_i16(&bytes[offset..])
        } else {
            BigEndian::read_i16(&bytes[offset..])
        }
    };
    let read_f32 = |offset: usize| -> f32 {
        if little_endian {
            LittleEndian::read_f32(&bytes[offset..])
        } else {
            BigEndian::read_f32(&bytes[offset..])
        }
    };

    let rank = read_i16(offsets::DIM);
    if !(3..=4).contains(&rank) {
        return Err(SegError::Config(format!(
            "{}: unsupported dimensionality {rank} (expected a 3D volume)",
            path.display()
        )));
    }
    let shape = [
        read_i16(offsets::DIM + 2) as usize,
        read_i16(offsets::DIM + 4) as usize,
        read_i16(offsets::DIM + 6) as usize,
    ];
    let mut srow = [[0.0f32; 4]; 3];
    for (row, base) in [offsets::SROW_X, offsets::SROW_Y, offsets::SROW_Z]
        .into_iter()
        .enumerate()
    {
        for column in 0..4 {
            srow[row][column] = read_f32(base + 4 * column);
        }
    }

    Ok(Header {
        little_endian,
        shape,
        datatype: read_i16(offsets::DATATYPE),
        pixdim: [
            read_f32(offsets::PIXDIM + 4),
            read_f32(offsets::PIXDIM + 8),
            read_f32(offsets::PIXDIM + 12),
        ],
        vox_offset: read_f32(offsets::VOX_OFFSET) as usize,
        scl_slope: read_f32(offsets::SCL_SLOPE),
        scl_inter: read_f32(offsets::SCL_INTER),
        srow,
    })
}

fn geometry_of(header: &Header) -> VolumeGeometry {
    let mut affine = [[0.0f32; 4]; 4];
    affine[..3].copy_from_slice(&header.srow);
    affine[3][3] = 1.0;
    // A zero sform falls back to pixdim scaling on the diagonal.
    if header.srow.iter().flatten().all(|&v| v == 0.0) {
        affine = VolumeGeometry::with_voxel_sizes(header.pixdim).affine;
    }
    VolumeGeometry {
        affine,
        voxel_sizes: header.pixdim,
    }
}

fn decode_voxels(header: &Header, bytes: &[u8], path: &Path) -> Result<Vec<f32>> {
    let count = header.shape.iter().product::<usize>();
    let element = match header.datatype {
        datatype::UINT8 => 1,
        datatype::INT16 => 2,
        datatype::INT32 | datatype::FLOAT32 => 4,
        datatype::FLOAT64 => 8,
        other => {
            return Err(SegError::Config(format!(
                "{}: unsupported NIfTI datatype {other}",
                path.display()
            )))
        }
    };
    let data = bytes
        .get(header.vox_offset..header.vox_offset + count * element)
        .ok_or_else(|| {
            SegError::Config(format!("{}: truncated voxel data", path.display()))
        })?;

    let le = header.little_endian;
    let mut voxels = Vec::with_capacity(count);
    for index in 0..count {
        let offset = index * element;
        let raw = match header.datatype {
            datatype::UINT8 => f32::from(data[offset]),
            datatype::INT16 => {
                let value = if le {
                    LittleEndian::read_i16(&data[offset..])
                } else {
                    BigEndian::read_i16(&data[offset..])
                };
                f32::from(value)
            }
            datatype::INT32 => {
                let value = if le {
                    LittleEndian::read_i32(&data[offset..])
                } else {
                    BigEndian::read_i32(&data[offset..])
                };
                value as f32
            }
            datatype::FLOAT32 => {
                if le {
                    LittleEndian::read_f32(&data[offset..])
                } else {
                    BigEndian::read_f32(&data[offset..])
                }
            }
            datatype::FLOAT64 => {
                let value = if le {
                    LittleEndian::read_f64(&data[offset..])
                } else {
                    BigEndian::read_f64(&data[offset..])
                };
                value as f32
            }
            _ => unreachable!("datatype validated above"),
        };
        voxels.push(raw);
    }

    if header.scl_slope != 0.0 && (header.scl_slope != 1.0 || header.scl_inter != 0.0) {
        for voxel in &mut voxels {
            *voxel = *voxel * header.scl_slope + header.scl_inter;
        }
    }
    Ok(voxels)
}

fn write_header<W: Write>(
    writer: &mut W,
    shape: [usize; 3],
    geometry: &VolumeGeometry,
    dtype: i16,
    bitpix: i16,
) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    LittleEndian::write_i32(&mut header[offsets::SIZEOF_HDR..], HEADER_SIZE as i32);
    let dim = [3i16, shape[0] as i16, shape[1] as i16, shape[2] as i16, 1, 1, 1, 1];
    for (index, &value) in dim.iter().enumerate() {
        LittleEndian::write_i16(&mut header[offsets::DIM + 2 * index..], value);
    }
    LittleEndian::write_i16(&mut header[offsets::DATATYPE..], dtype);
    LittleEndian::write_i16(&mut header[offsets::BITPIX..], bitpix);
    let pixdim = [
        1.0f32,
        geometry.voxel_sizes[0],
        geometry.voxel_sizes[1],
        geometry.voxel_sizes[2],
        0.0,
        0.0,
        0.0,
        0.0,
    ];
    for (index, &value) in pixdim.iter().enumerate() {
        LittleEndian::write_f32(&mut header[offsets::PIXDIM + 4 * index..], value);
    }
    LittleEndian::write_f32(&mut header[offsets::VOX_OFFSET..], VOX_OFFSET as f32);
    LittleEndian::write_f32(&mut header[offsets::SCL_SLOPE..], 1.0);
    LittleEndian::write_f32(&mut header[offsets::SCL_INTER..], 0.0);
    LittleEndian::write_i16(&mut header[offsets::SFORM_CODE..], 1);
    for (row, base) in [offsets::SROW_X, offsets::SROW_Y, offsets::SROW_Z]
        .into_iter()
        .enumerate()
    {
        for column in 0..4 {
            LittleEndian::write_f32(
                &mut header[base + 4 * column..],
                geometry.affine[row][column],
            );
        }
    }
    header[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(b"n+1\0");

    writer.write_all(&header)?;
    // Four bytes of extension padding up to vox_offset.
    writer.write_all(&[0u8; VOX_OFFSET - HEADER_SIZE])?;
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        SegError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot create {}: {e}", path.display()),
        ))
    })?;
    if is_gz(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
    }
    Ok(())
}

impl VolumeIo for NiftiVolumeIo {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn load(&self, path: &Path) -> Result<(VolumeGeometry, Array3<f32>)> {
        let bytes = read_all(path)?;
        let header = parse_header(&bytes, path)?;
        let voxels = decode_voxels(&header, &bytes, path)?;
        // NIfTI stores voxels in Fortran order (first axis fastest).
        let volume = Array3::from_shape_vec(
            (header.shape[2], header.shape[1], header.shape[0]),
            voxels,
        )
        .map_err(|e| SegError::Config(format!("{}: {e}", path.display())))?
        .permuted_axes([2, 1, 0])
        .as_standard_layout()
        .to_owned();
        Ok((geometry_of(&header), volume))
    }

    fn save(&self, path: &Path, geometry: &VolumeGeometry, data: &Array3<f32>) -> Result<()> {
        let shape = [data.shape()[0], data.shape()[1], data.shape()[2]];
        let mut bytes = Vec::with_capacity(VOX_OFFSET + data.len() * 4);
        write_header(&mut bytes, shape, geometry, datatype::FLOAT32, 32)?;
        for k in 0..shape[2] {
            for j in 0..shape[1] {
                for i in 0..shape[0] {
                    bytes.write_f32::<LittleEndian>(data[[i, j, k]])?;
                }
            }
        }
        write_file(path, &bytes)
    }

    fn save_labels(
        &self,
        path: &Path,
        geometry: &VolumeGeometry,
        data: &Array3<i16>,
    ) -> Result<()> {
        let shape = [data.shape()[0], data.shape()[1], data.shape()[2]];
        let mut bytes = Vec::with_capacity(VOX_OFFSET + data.len() * 2);
        write_header(&mut bytes, shape, geometry, datatype::INT16, 16)?;
        for k in 0..shape[2] {
            for j in 0..shape[1] {
                for i in 0..shape[0] {
                    bytes.write_i16::<LittleEndian>(data[[i, j, k]])?;
                }
            }
        }
        write_file(path, &bytes)
    }

    fn is_conformed(&self, path: &Path) -> Result<bool> {
        let bytes = read_header_bytes(path)?;
        let header = parse_header(&bytes, path)?;
        Ok(header.pixdim.iter().all(|&size| (size - 1.0).abs() <= 1e-3))
    }

    fn conform(&self, path: &Path) -> Result<(VolumeGeometry, Array3<f32>)> {
        let (geometry, data) = self.load(path)?;
        Ok(resample_nearest_1mm(&geometry, &data))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }
}
