//! Superblock location and selection.
//!
//! Up to four copies live at fixed physical offsets; each readable copy is
//! validated (magic + CRC) and the highest generation wins.

use lode_block::{BlockReader, ByteDevice};
use lode_error::{Error, Result};
use lode_ondisk::{Superblock, verify_superblock_checksum};
use lode_types::{SUPER_INFO_SIZE, SUPERBLOCK_PADDRS};
use tracing::{debug, info};

/// Validate one superblock region: magic first, then the checksum.
pub fn validate_superblock(region: &[u8], paddr: u64) -> Result<Superblock> {
    let sb = Superblock::parse(region)?;
    verify_superblock_checksum(region).map_err(|_| Error::BadChecksum {
        kind: "superblock",
        addr: paddr,
    })?;
    Ok(sb)
}

/// Read every present superblock copy and return the freshest valid one,
/// together with its 1-based copy number.
///
/// A copy that cannot be read (the device is smaller than its offset) or
/// fails validation is skipped; it disqualifies only itself. With no valid
/// copy at all the volume is not a btrfs filesystem we can mount.
pub fn locate_superblock<D: ByteDevice>(reader: &BlockReader<D>) -> Result<(Superblock, usize)> {
    let mut best: Option<(Superblock, usize)> = None;

    for (idx, paddr) in SUPERBLOCK_PADDRS.iter().copied().enumerate() {
        let copy = idx + 1;
        let region = match reader.direct_read(paddr, SUPER_INFO_SIZE) {
            Ok(region) => region,
            Err(err) => {
                debug!(target: "lode::volume", copy, %err, "superblock copy unreadable");
                continue;
            }
        };

        match validate_superblock(&region, paddr) {
            Ok(sb) => {
                let better = best
                    .as_ref()
                    .is_none_or(|(current, _)| sb.generation > current.generation);
                if better {
                    best = Some((sb, copy));
                }
            }
            Err(err) => {
                debug!(target: "lode::volume", copy, %err, "superblock copy rejected");
            }
        }
    }

    let (sb, copy) = best.ok_or(Error::BadMagic)?;
    info!(
        target: "lode::volume",
        copy,
        generation = sb.generation,
        nodesize = sb.nodesize,
        label = %sb.label,
        "superblock selected"
    );
    Ok((sb, copy))
}
