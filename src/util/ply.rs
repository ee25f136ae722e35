//! PLY export of coloured point clouds.
//!
//! Vertices carry `float x, y, z` and `uchar red, green, blue`. Both the
//! ASCII and the binary little-endian encodings are written and read back;
//! binary vertex records go through `bincode` with fixed-width integers.

use crate::stereo::{ColoredPoint, PointCloud};
use crate::util::UtilError;
use nalgebra::Point3;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyFormat {
    Ascii,
    BinaryLittleEndian,
}

impl PlyFormat {
    fn header_name(&self) -> &'static str {
        match self {
            PlyFormat::Ascii => "ascii",
            PlyFormat::BinaryLittleEndian => "binary_little_endian",
        }
    }

    fn from_header_name(name: &str) -> Option<Self> {
        match name {
            "ascii" => Some(PlyFormat::Ascii),
            "binary_little_endian" => Some(PlyFormat::BinaryLittleEndian),
            _ => None,
        }
    }
}

/// One vertex as laid out in the binary body.
#[derive(Debug, Clone, Copy, PartialEq, bincode::Encode, bincode::Decode)]
struct VertexRecord {
    x: f32,
    y: f32,
    z: f32,
    red: u8,
    green: u8,
    blue: u8,
}

impl From<&ColoredPoint> for VertexRecord {
    fn from(point: &ColoredPoint) -> Self {
        let [red, green, blue] = point.color;
        VertexRecord {
            x: point.position.x as f32,
            y: point.position.y as f32,
            z: point.position.z as f32,
            red,
            green,
            blue,
        }
    }
}

impl From<VertexRecord> for ColoredPoint {
    fn from(record: VertexRecord) -> Self {
        ColoredPoint {
            position: Point3::new(record.x as f64, record.y as f64, record.z as f64),
            color: [record.red, record.green, record.blue],
        }
    }
}

fn binary_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn write_header<W: Write>(writer: &mut W, format: PlyFormat, count: usize) -> std::io::Result<()> {
    writeln!(writer, "ply")?;
    writeln!(writer, "format {} 1.0", format.header_name())?;
    writeln!(writer, "element vertex {count}")?;
    writeln!(writer, "property float x")?;
    writeln!(writer, "property float y")?;
    writeln!(writer, "property float z")?;
    writeln!(writer, "property uchar red")?;
    writeln!(writer, "property uchar green")?;
    writeln!(writer, "property uchar blue")?;
    writeln!(writer, "end_header")
}

/// Encodes a cloud into any writer.
pub fn write_ply_to<W: Write>(
    writer: &mut W,
    cloud: &PointCloud,
    format: PlyFormat,
) -> Result<(), UtilError> {
    write_header(writer, format, cloud.points.len())?;
    for point in &cloud.points {
        let record = VertexRecord::from(point);
        match format {
            PlyFormat::Ascii => {
                writeln!(
                    writer,
                    "{} {} {} {} {} {}",
                    record.x, record.y, record.z, record.red, record.green, record.blue
                )?;
            }
            PlyFormat::BinaryLittleEndian => {
                bincode::encode_into_std_write(record, writer, binary_config())?;
            }
        }
    }
    Ok(())
}

pub fn write_ply<P: AsRef<Path>>(
    path: P,
    cloud: &PointCloud,
    format: PlyFormat,
) -> Result<(), UtilError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_ply_to(&mut writer, cloud, format)?;
    writer.flush()?;
    Ok(())
}

/// Header fields the reader needs, plus the number of header lines.
struct PlyHeader {
    format: PlyFormat,
    vertex_count: usize,
    lines: usize,
}

fn read_header<R: BufRead>(reader: &mut R) -> Result<PlyHeader, UtilError> {
    let mut format = None;
    let mut vertex_count = None;
    let mut line = String::new();
    let mut index = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(UtilError::ParseError {
                line: index,
                reason: "missing 'end_header'".to_string(),
            });
        }
        index += 1;
        let trimmed = line.trim();
        if index == 1 {
            if trimmed != "ply" {
                return Err(UtilError::ParseError {
                    line: 1,
                    reason: "missing 'ply' magic".to_string(),
                });
            }
            continue;
        }
        if trimmed == "end_header" {
            break;
        }
        if let Some(rest) = trimmed.strip_prefix("format ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            format = Some(PlyFormat::from_header_name(name).ok_or_else(|| {
                UtilError::ParseError {
                    line: index,
                    reason: format!("unsupported format '{trimmed}'"),
                }
            })?);
        }
        if let Some(count) = trimmed.strip_prefix("element vertex") {
            vertex_count = Some(count.trim().parse::<usize>().map_err(|e| {
                UtilError::ParseError {
                    line: index,
                    reason: e.to_string(),
                }
            })?);
        }
    }
    let missing = |what: &str| UtilError::ParseError {
        line: 0,
        reason: format!("missing {what}"),
    };
    Ok(PlyHeader {
        format: format.ok_or_else(|| missing("format line"))?,
        vertex_count: vertex_count.ok_or_else(|| missing("vertex element"))?,
        lines: index,
    })
}

fn read_ascii_body<R: BufRead>(reader: R, header: &PlyHeader) -> Result<Vec<ColoredPoint>, UtilError> {
    let mut points = Vec::with_capacity(header.vertex_count);
    for (offset, line) in reader.lines().take(header.vertex_count).enumerate() {
        let line = line?;
        let parse_error = |reason: String| UtilError::ParseError {
            line: header.lines + offset + 1,
            reason,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(parse_error(format!("expected 6 fields, found {}", fields.len())));
        }
        let mut xyz = [0.0f32; 3];
        for (dst, src) in xyz.iter_mut().zip(&fields[..3]) {
            *dst = src.parse::<f32>().map_err(|e| parse_error(e.to_string()))?;
        }
        let mut rgb = [0u8; 3];
        for (dst, src) in rgb.iter_mut().zip(&fields[3..]) {
            *dst = src.parse::<u8>().map_err(|e| parse_error(e.to_string()))?;
        }
        points.push(ColoredPoint::from(VertexRecord {
            x: xyz[0],
            y: xyz[1],
            z: xyz[2],
            red: rgb[0],
            green: rgb[1],
            blue: rgb[2],
        }));
    }
    Ok(points)
}

fn read_binary_body<R: Read>(mut reader: R, header: &PlyHeader) -> Result<Vec<ColoredPoint>, UtilError> {
    let mut points = Vec::with_capacity(header.vertex_count);
    for index in 0..header.vertex_count {
        let record: VertexRecord = bincode::decode_from_std_read(&mut reader, binary_config())
            .map_err(|e| UtilError::ParseError {
                line: 0,
                reason: format!("vertex {index}: {e}"),
            })?;
        points.push(record.into());
    }
    Ok(points)
}

/// Reads a PLY written by [`write_ply`], in either encoding.
///
/// Only the vertex layout produced here is understood.
pub fn read_ply<P: AsRef<Path>>(path: P) -> Result<PointCloud, UtilError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(&mut reader)?;
    let points = match header.format {
        PlyFormat::Ascii => read_ascii_body(reader, &header)?,
        PlyFormat::BinaryLittleEndian => read_binary_body(reader, &header)?,
    };
    if points.len() != header.vertex_count {
        return Err(UtilError::ParseError {
            line: 0,
            reason: format!(
                "expected {} vertices, found {}",
                header.vertex_count,
                points.len()
            ),
        });
    }
    Ok(PointCloud {
        points,
        excluded: 0,
    })
}
