//! Durable snapshots of the whole simulation state.
//!
//! The file format is a versioned binary record: magic bytes, a YAML header
//! (human inspectable) with a little-endian length prefix, the raw soup
//! bytes, then one fixed-width record per saved IP. Files are written to a
//! temporary path and renamed into place, so a reader never observes a
//! partial snapshot.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::vm::SavableIp;

const MAGIC: &[u8; 5] = b"EVSNP";
const FORMAT_VERSION: u32 = 1;

/// id, x, y, steps, current instruction byte
const IP_RECORD_LEN: usize = 4 + 4 + 4 + 8 + 1;

/// Snapshot header with metadata and shape validation info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Format version for forward compatibility
    pub version: u32,
    /// Generation counter at save time
    pub generation: u64,
    /// Soup dimensions; the soup field must be exactly `dim_x * dim_y` bytes
    pub dim_x: i32,
    pub dim_y: i32,
    /// Number of IP records following the soup
    pub num_ips: u32,
    /// Id counter so reloaded runs keep assigning fresh ids
    pub next_ip_id: u32,
    /// Seed the run was initialized with
    pub rand_seed: u64,
}

/// Complete simulation state as captured for disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub generation: u64,
    pub dim_x: i32,
    pub dim_y: i32,
    pub soup: Vec<u8>,
    pub ips: Vec<SavableIp>,
    pub next_ip_id: u32,
    pub rand_seed: u64,
}

impl Snapshot {
    /// Save to `path` atomically: the bytes go to a sibling temporary file
    /// which is renamed over the target once fully written.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = match path.file_name() {
            Some(name) => {
                let mut tmp = name.to_os_string();
                tmp.push(".tmp");
                path.with_file_name(tmp)
            }
            None => return Err(format!("invalid snapshot path: {}", path.display()).into()),
        };

        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(MAGIC)?;

            let header = SnapshotHeader {
                version: FORMAT_VERSION,
                generation: self.generation,
                dim_x: self.dim_x,
                dim_y: self.dim_y,
                num_ips: self.ips.len() as u32,
                next_ip_id: self.next_ip_id,
                rand_seed: self.rand_seed,
            };
            let header_yaml = serde_yaml::to_string(&header)?;
            writer.write_all(&(header_yaml.len() as u32).to_le_bytes())?;
            writer.write_all(header_yaml.as_bytes())?;

            writer.write_all(&(self.soup.len() as u64).to_le_bytes())?;
            writer.write_all(&self.soup)?;

            for ip in &self.ips {
                writer.write_all(&ip.id.to_le_bytes())?;
                writer.write_all(&ip.x.to_le_bytes())?;
                writer.write_all(&ip.y.to_le_bytes())?;
                writer.write_all(&ip.steps.to_le_bytes())?;
                writer.write_all(&[ip.current_instruction_byte as u8])?;
            }

            writer.flush()?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a snapshot. Corruption, version mismatch, or a soup that does
    /// not match its declared dimensions are all errors.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 5];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err("invalid snapshot file: bad magic bytes".into());
        }

        let mut len4 = [0u8; 4];
        reader.read_exact(&mut len4)?;
        let header_len = u32::from_le_bytes(len4) as usize;
        let mut header_yaml = vec![0u8; header_len];
        reader.read_exact(&mut header_yaml)?;
        let header: SnapshotHeader = serde_yaml::from_slice(&header_yaml)?;

        if header.version != FORMAT_VERSION {
            return Err(format!(
                "unsupported snapshot version: {} (expected {})",
                header.version, FORMAT_VERSION
            )
            .into());
        }
        if header.dim_x <= 0 || header.dim_y <= 0 {
            return Err(format!(
                "invalid snapshot dimensions: {}x{}",
                header.dim_x, header.dim_y
            )
            .into());
        }

        let mut len8 = [0u8; 8];
        reader.read_exact(&mut len8)?;
        let soup_len = u64::from_le_bytes(len8) as usize;
        let expected = header.dim_x as usize * header.dim_y as usize;
        if soup_len != expected {
            return Err(format!(
                "soup length mismatch: got {}, expected {} ({}x{})",
                soup_len, expected, header.dim_x, header.dim_y
            )
            .into());
        }
        let mut soup = vec![0u8; soup_len];
        reader.read_exact(&mut soup)?;

        let mut ips = Vec::with_capacity(header.num_ips as usize);
        let mut record = [0u8; IP_RECORD_LEN];
        for _ in 0..header.num_ips {
            reader.read_exact(&mut record)?;
            ips.push(SavableIp {
                id: u32::from_le_bytes([record[0], record[1], record[2], record[3]]),
                x: i32::from_le_bytes([record[4], record[5], record[6], record[7]]),
                y: i32::from_le_bytes([record[8], record[9], record[10], record[11]]),
                steps: u64::from_le_bytes([
                    record[12], record[13], record[14], record[15], record[16], record[17],
                    record[18], record[19],
                ]),
                current_instruction_byte: record[20] as i8,
            });
        }

        Ok(Self {
            generation: header.generation,
            dim_x: header.dim_x,
            dim_y: header.dim_y,
            soup,
            ips,
            next_ip_id: header.next_ip_id,
            rand_seed: header.rand_seed,
        })
    }
}
