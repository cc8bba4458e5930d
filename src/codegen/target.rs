// This module describes the compilation targets. A TargetDesc carries everything the code
// generator and the packager need to know about one IPU generation: the LLVM triple and data
// layout written into every module, the toolchain target name passed to popc, the tile count
// used to validate vertex placement, per-tile memory, the number of worker contexts and the
// tile clock frequency used to turn cycle counts into wall time. IPUModel targets reuse the
// ipu2 code generation parameters with an arbitrary tile count.

//! Target descriptions.

use std::fmt;

/// LLVM triple of the Colossus backend.
pub const COLOSSUS_TRIPLE: &str = "colossus-graphcore-unknown-elf";

/// LLVM data layout of the Colossus backend: little endian, 32-bit pointers,
/// 32-bit stack alignment.
pub const COLOSSUS_DATA_LAYOUT: &str =
    "e-m:e-p:32:32-i1:8:32-i8:8:32-i16:16:32-i64:32-i128:64-f16:16-f32:32-f64:32-v64:64-a:0:32-n32";

const TILES_PER_IPU: u32 = 1472;
const TILE_MEMORY_BYTES: u32 = 624 * 1024;
const WORKER_CONTEXTS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDesc {
    /// Short name, also used in cache keys: `ipu2`, `ipu21`, `model:<tiles>`.
    pub name: String,
    pub triple: &'static str,
    pub data_layout: &'static str,
    /// Value of the toolchain's `--target` option.
    pub toolchain_target: &'static str,
    pub num_tiles: u32,
    pub tile_memory_bytes: u32,
    pub worker_contexts: u32,
    pub clock_hz: u64,
}

impl TargetDesc {
    /// Mk2 IPU (GC200).
    pub fn ipu2() -> Self {
        Self {
            name: "ipu2".to_string(),
            triple: COLOSSUS_TRIPLE,
            data_layout: COLOSSUS_DATA_LAYOUT,
            toolchain_target: "ipu2",
            num_tiles: TILES_PER_IPU,
            tile_memory_bytes: TILE_MEMORY_BYTES,
            worker_contexts: WORKER_CONTEXTS,
            clock_hz: 1_330_000_000,
        }
    }

    /// Bow IPU.
    pub fn ipu21() -> Self {
        Self {
            name: "ipu21".to_string(),
            toolchain_target: "ipu21",
            clock_hz: 1_850_000_000,
            ..Self::ipu2()
        }
    }

    /// Host-simulated IPU with `num_tiles` tiles.
    pub fn model(num_tiles: u32) -> Self {
        Self {
            name: format!("model:{}", num_tiles),
            num_tiles,
            ..Self::ipu2()
        }
    }

    /// Parse `ipu2`, `ipu21` or `model:<tiles>`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ipu2" => Some(Self::ipu2()),
            "ipu21" => Some(Self::ipu21()),
            other => {
                let tiles: u32 = other.strip_prefix("model:")?.parse().ok()?;
                (tiles > 0).then(|| Self::model(tiles))
            }
        }
    }

    pub fn is_model(&self) -> bool {
        self.name.starts_with("model:")
    }
}

impl Default for TargetDesc {
    fn default() -> Self {
        Self::ipu2()
    }
}

impl fmt::Display for TargetDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names() {
        assert_eq!(TargetDesc::from_name("ipu21").unwrap().clock_hz, 1_850_000_000);
        let model = TargetDesc::from_name("model:4").unwrap();
        assert_eq!(model.num_tiles, 4);
        assert!(model.is_model());
        assert_eq!(model.toolchain_target, "ipu2");
        assert!(TargetDesc::from_name("model:0").is_none());
        assert!(TargetDesc::from_name("gpu").is_none());
    }
}
