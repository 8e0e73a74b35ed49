use std::fmt;

use anyhow::{Context, Result, bail};

use super::mapper::Mapper;

const ALPHABET: &[u8; 16] = b"APZLGITYEOXUKSVN";

/// Decoded Game Genie code: a ROM address, the replacement byte and an optional compare byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchCode {
    pub address: u16,
    pub value: u8,
    pub compare: Option<u8>,
}

impl PatchCode {
    pub fn decode(code: &str) -> Result<Self> {
        let code = code.trim();
        let n = code
            .bytes()
            .map(|letter| {
                let upper = letter.to_ascii_uppercase();
                ALPHABET
                    .iter()
                    .position(|&c| c == upper)
                    .map(|idx| idx as u16)
                    .with_context(|| format!("invalid patch letter '{}' in {code}", letter as char))
            })
            .collect::<Result<Vec<u16>>>()?;

        if n.len() != 6 && n.len() != 8 {
            bail!("patch code {code} must be 6 or 8 letters, got {}", n.len());
        }

        let address = 0x8000
            | ((n[3] & 7) << 12)
            | ((n[5] & 7) << 8)
            | ((n[4] & 8) << 8)
            | ((n[2] & 7) << 4)
            | ((n[1] & 8) << 4)
            | (n[4] & 7)
            | (n[3] & 8);

        let value_low_bit3 = if n.len() == 6 { n[5] } else { n[7] };
        let value =
            (((n[1] & 7) << 4) | ((n[0] & 8) << 4) | (n[0] & 7) | (value_low_bit3 & 8)) as u8;

        let compare = (n.len() == 8).then(|| {
            (((n[7] & 7) << 4) | ((n[6] & 8) << 4) | (n[6] & 7) | (n[5] & 8)) as u8
        });

        Ok(Self {
            address,
            value,
            compare,
        })
    }

    pub fn encode(&self) -> String {
        let a = self.address & 0x7FFF;
        let v = self.value as u16;
        let mut n = vec![
            (v & 7) | ((v >> 4) & 8),
            ((v >> 4) & 7) | ((a >> 4) & 8),
            (a >> 4) & 7,
            ((a >> 12) & 7) | (a & 8),
            (a & 7) | ((a >> 8) & 8),
            (a >> 8) & 7,
        ];
        match self.compare {
            None => n[5] |= v & 8,
            Some(compare) => {
                let c = compare as u16;
                // Bit 3 of the third letter flags the 8-letter form.
                n[2] |= 8;
                n[5] |= c & 8;
                n.push((c & 7) | ((c >> 4) & 8));
                n.push(((c >> 4) & 7) | (v & 8));
            }
        }
        n.into_iter()
            .map(|idx| ALPHABET[idx as usize] as char)
            .collect()
    }
}

impl fmt::Display for PatchCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(u32);

#[derive(Debug, Clone)]
struct AppliedPatch {
    id: PatchId,
    code: PatchCode,
    offset: usize,
    original: u8,
}

/// Applies codes to PRG ROM through the mapper's current address translation and remembers
/// the bytes it replaced.
#[derive(Debug, Default)]
pub struct RomPatcher {
    applied: Vec<AppliedPatch>,
    next_id: u32,
}

impl RomPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, mapper: &mut dyn Mapper, code: &PatchCode) -> Result<PatchId> {
        let offset = mapper.prg_rom_offset(code.address).with_context(|| {
            format!("patch address ${:04X} is not mapped to PRG ROM", code.address)
        })?;
        let rom = mapper.prg_rom_mut();
        let current = *rom.get(offset).with_context(|| {
            format!(
                "patch address ${:04X} resolves past the end of PRG ROM (offset {offset})",
                code.address
            )
        })?;

        if let Some(compare) = code.compare {
            if current != compare {
                bail!(
                    "compare byte mismatch at ${:04X}: expected ${compare:02X}, found ${current:02X}",
                    code.address
                );
            }
        }

        rom[offset] = code.value;
        let id = PatchId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.applied.push(AppliedPatch {
            id,
            code: *code,
            offset,
            original: current,
        });
        Ok(id)
    }

    pub fn restore(&mut self, mapper: &mut dyn Mapper, id: PatchId) -> Result<PatchCode> {
        let idx = self
            .applied
            .iter()
            .position(|patch| patch.id == id)
            .with_context(|| format!("no active patch with id {}", id.0))?;
        let patch = self.applied.remove(idx);

        // A later patch on the same byte inherits the true original instead.
        if let Some(later) = self.applied[idx..]
            .iter_mut()
            .find(|later| later.offset == patch.offset)
        {
            later.original = patch.original;
        } else if let Some(byte) = mapper.prg_rom_mut().get_mut(patch.offset) {
            *byte = patch.original;
        }
        Ok(patch.code)
    }

    pub fn restore_all(&mut self, mapper: &mut dyn Mapper) -> usize {
        let count = self.applied.len();
        let rom = mapper.prg_rom_mut();
        for patch in self.applied.drain(..).rev() {
            if let Some(byte) = rom.get_mut(patch.offset) {
                *byte = patch.original;
            }
        }
        count
    }

    pub fn active(&self) -> impl Iterator<Item = (PatchId, PatchCode)> + '_ {
        self.applied.iter().map(|patch| (patch.id, patch.code))
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}
