// This module is the host-side model of a device graph. A Graph is created for one target
// and holds the tensors declared on it (element type, length and the tile mapping of each
// region), the codelets registered with it by symbol together with their vertex signature,
// and the vertices added through add_vertex. Tensors are referred to by light handles;
// slicing a handle yields an Allocation, and tagging an allocation with a direction yields the
// VertexVector that is bound to a codelet field. The Device trait is the narrow interface to
// whatever executes the graph; IpuModel implements it for host-side use.

//! Device graph model.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::codegen::{CompiledArtifact, TargetDesc, VertexField};
use crate::core::error::BindingMismatchError;
use crate::kernel::{Direction, ElemType};

/// What the graph is built for.
pub trait Device {
    fn target(&self) -> &TargetDesc;

    fn num_tiles(&self) -> u32 {
        self.target().num_tiles
    }

    /// Tile clock in Hz, used to convert cycle counts to time.
    fn tile_clock_frequency(&self) -> u64 {
        self.target().clock_hz
    }
}

/// A host-simulated IPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpuModel {
    target: TargetDesc,
}

impl IpuModel {
    pub fn new(num_tiles: u32) -> Self {
        Self {
            target: TargetDesc::model(num_tiles),
        }
    }
}

impl Default for IpuModel {
    fn default() -> Self {
        Self::new(TargetDesc::ipu2().num_tiles)
    }
}

impl Device for IpuModel {
    fn target(&self) -> &TargetDesc {
        &self.target
    }
}

/// Handle to a tensor of a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tensor {
    id: u32,
    elem: ElemType,
    len: u32,
}

impl Tensor {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn elem(&self) -> ElemType {
        self.elem
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole tensor.
    pub fn all(&self) -> Allocation {
        Allocation {
            tensor: self.id,
            elem: self.elem,
            offset: 0,
            len: self.len,
        }
    }

    /// Elements `range` of the tensor; the range is checked when bound.
    pub fn slice(&self, range: Range<u32>) -> Allocation {
        Allocation {
            tensor: self.id,
            elem: self.elem,
            offset: range.start,
            len: range.end.saturating_sub(range.start),
        }
    }

    /// Element `index` as a one-element allocation.
    pub fn element(&self, index: u32) -> Allocation {
        Allocation {
            tensor: self.id,
            elem: self.elem,
            offset: index,
            len: 1,
        }
    }
}

/// A contiguous region of one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub tensor: u32,
    pub elem: ElemType,
    pub offset: u32,
    pub len: u32,
}

impl Allocation {
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.len)
    }

    /// Split into `parts` equal consecutive allocations.
    pub fn split(&self, parts: u32) -> Option<Vec<Allocation>> {
        if parts == 0 || self.len % parts != 0 {
            return None;
        }
        let chunk = self.len / parts;
        Some(
            (0..parts)
                .map(|i| Allocation {
                    offset: self.offset + i * chunk,
                    len: chunk,
                    ..*self
                })
                .collect(),
        )
    }
}

/// An allocation bound to a vertex field with a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexVector {
    pub direction: Direction,
    pub allocation: Allocation,
}

impl VertexVector {
    pub fn input(allocation: Allocation) -> Self {
        Self {
            direction: Direction::Input,
            allocation,
        }
    }

    pub fn output(allocation: Allocation) -> Self {
        Self {
            direction: Direction::Output,
            allocation,
        }
    }

    pub fn in_out(allocation: Allocation) -> Self {
        Self {
            direction: Direction::InOut,
            allocation,
        }
    }

    pub fn elem(&self) -> ElemType {
        self.allocation.elem
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexId(pub(crate) usize);

impl VertexId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A codelet instance placed on a tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    pub id: VertexId,
    /// Symbol of the codelet, i.e. its name.
    pub codelet: String,
    pub tile: u32,
    /// Bindings in the order of the codelet fields.
    pub bindings: Vec<(String, VertexVector)>,
}

impl Vertex {
    pub fn binding(&self, field: &str) -> Option<&VertexVector> {
        self.bindings.iter().find(|(name, _)| name == field).map(|(_, v)| v)
    }
}

/// A region of a tensor placed on one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub start: u32,
    pub end: u32,
    pub tile: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub elem: ElemType,
    pub len: u32,
    /// Mapped regions, sorted and non-overlapping.
    pub mapping: Vec<TileRegion>,
}

impl TensorInfo {
    fn map_region(&mut self, start: u32, end: u32, tile: u32) {
        let mut regions = Vec::with_capacity(self.mapping.len() + 2);
        for r in self.mapping.drain(..) {
            if r.end <= start || r.start >= end {
                regions.push(r);
                continue;
            }
            if r.start < start {
                regions.push(TileRegion { end: start, ..r });
            }
            if r.end > end {
                regions.push(TileRegion { start: end, ..r });
            }
        }
        regions.push(TileRegion { start, end, tile });
        regions.sort_by_key(|r| r.start);
        self.mapping = regions;
    }

    /// Distinct tiles holding any element of `start..end`.
    pub fn tiles_of(&self, start: u32, end: u32) -> Vec<u32> {
        let mut tiles: Vec<u32> = self
            .mapping
            .iter()
            .filter(|r| r.start < end && r.end > start)
            .map(|r| r.tile)
            .collect();
        tiles.sort_unstable();
        tiles.dedup();
        tiles
    }
}

/// A codelet known to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCodelet {
    pub symbol: String,
    pub fields: Vec<VertexField>,
    /// Present when the codelet was registered from generated code.
    pub artifact: Option<Arc<CompiledArtifact>>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    target: TargetDesc,
    tensors: Vec<TensorInfo>,
    codelets: BTreeMap<String, RegisteredCodelet>,
    vertices: Vec<Vertex>,
}

impl Graph {
    pub fn new(device: &dyn Device) -> Self {
        Self::for_target(device.target().clone())
    }

    pub fn for_target(target: TargetDesc) -> Self {
        Self {
            target,
            tensors: Vec::new(),
            codelets: BTreeMap::new(),
            vertices: Vec::new(),
        }
    }

    pub fn target(&self) -> &TargetDesc {
        &self.target
    }

    pub fn num_tiles(&self) -> u32 {
        self.target.num_tiles
    }

    pub fn add_variable(&mut self, name: impl Into<String>, elem: ElemType, len: u32) -> Tensor {
        let id = self.tensors.len() as u32;
        self.tensors.push(TensorInfo {
            name: name.into(),
            elem,
            len,
            mapping: Vec::new(),
        });
        Tensor { id, elem, len }
    }

    pub fn tensor(&self, id: u32) -> Option<&TensorInfo> {
        self.tensors.get(id as usize)
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    /// Place the whole of `tensor` on `tile`.
    pub fn set_tile_mapping(&mut self, tensor: &Tensor, tile: u32) -> Result<(), BindingMismatchError> {
        self.map_allocation(&tensor.all(), tile)
    }

    /// Place the elements of `allocation` on `tile`, replacing earlier mappings.
    pub fn map_allocation(&mut self, allocation: &Allocation, tile: u32) -> Result<(), BindingMismatchError> {
        let num_tiles = self.num_tiles();
        if tile >= num_tiles {
            return Err(BindingMismatchError::TileOutOfRange { tile, num_tiles });
        }
        self.checked_tensor(allocation)?;
        let (start, end) = (allocation.offset, allocation.end());
        let info = &mut self.tensors[allocation.tensor as usize];
        log::trace!("mapped {}[{}..{}] to tile {}", info.name, start, end, tile);
        info.map_region(start, end, tile);
        Ok(())
    }

    /// Tensor info of `allocation`, checking that the allocation is in bounds.
    pub(crate) fn checked_tensor(&self, allocation: &Allocation) -> Result<&TensorInfo, BindingMismatchError> {
        let info = self
            .tensor(allocation.tensor)
            .ok_or(BindingMismatchError::UnknownTensor {
                tensor: allocation.tensor,
            })?;
        if allocation.offset.checked_add(allocation.len).map_or(true, |end| end > info.len) {
            return Err(BindingMismatchError::SliceOutOfRange {
                tensor: info.name.clone(),
                offset: allocation.offset,
                end: allocation.offset.saturating_add(allocation.len),
                len: info.len,
            });
        }
        Ok(info)
    }

    pub fn codelet(&self, symbol: &str) -> Option<&RegisteredCodelet> {
        self.codelets.get(symbol)
    }

    pub fn codelets(&self) -> impl Iterator<Item = &RegisteredCodelet> {
        self.codelets.values()
    }

    /// Register a codelet from generated code. Registering twice is a no-op;
    /// a symbol registered without code picks up the artifact. Callers check
    /// that the artifact does not conflict with the registered entry.
    pub fn register_artifact(&mut self, artifact: &Arc<CompiledArtifact>) {
        let entry = self
            .codelets
            .entry(artifact.codelet.clone())
            .or_insert_with(|| RegisteredCodelet {
                symbol: artifact.codelet.clone(),
                fields: artifact.fields.clone(),
                artifact: None,
            });
        if entry.artifact.is_none() {
            entry.artifact = Some(Arc::clone(artifact));
        }
    }

    /// Register a codelet provided by an already loaded graph program.
    pub fn register_symbol(&mut self, symbol: impl Into<String>, fields: Vec<VertexField>) {
        let symbol = symbol.into();
        self.codelets.entry(symbol.clone()).or_insert(RegisteredCodelet {
            symbol,
            fields,
            artifact: None,
        });
    }

    pub(crate) fn push_vertex(&mut self, codelet: String, tile: u32, bindings: Vec<(String, VertexVector)>) -> VertexId {
        let id = VertexId(self.vertices.len());
        self.vertices.push(Vertex {
            id,
            codelet,
            tile,
            bindings,
        });
        id
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id.0)
    }

    /// Vertices placed on `tile`.
    pub fn vertices_on(&self, tile: u32) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter().filter(move |v| v.tile == tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remapping_splits_regions() {
        let mut graph = Graph::new(&IpuModel::new(4));
        let t = graph.add_variable("t", ElemType::F32, 8);
        graph.set_tile_mapping(&t, 0).unwrap();
        graph.map_allocation(&t.slice(2..4), 1).unwrap();

        let info = graph.tensor(t.id()).unwrap();
        let regions: Vec<(u32, u32, u32)> = info.mapping.iter().map(|r| (r.start, r.end, r.tile)).collect();
        assert_eq!(regions, [(0, 2, 0), (2, 4, 1), (4, 8, 0)]);
        assert_eq!(info.tiles_of(0, 3), [0, 1]);
        assert_eq!(info.tiles_of(4, 8), [0]);
    }

    #[test]
    fn mapping_checks_bounds() {
        let mut graph = Graph::new(&IpuModel::new(2));
        let t = graph.add_variable("t", ElemType::U32, 4);
        assert!(matches!(
            graph.map_allocation(&t.slice(2..6), 0),
            Err(BindingMismatchError::SliceOutOfRange { end: 6, len: 4, .. })
        ));
        assert_eq!(
            graph.set_tile_mapping(&t, 2),
            Err(BindingMismatchError::TileOutOfRange { tile: 2, num_tiles: 2 })
        );
    }

    #[test]
    fn split_requires_even_chunks() {
        let t = Tensor {
            id: 0,
            elem: ElemType::F32,
            len: 6,
        };
        let parts = t.all().split(3).unwrap();
        assert_eq!(parts.iter().map(|a| (a.offset, a.len)).collect::<Vec<_>>(), [(0, 2), (2, 2), (4, 2)]);
        assert!(t.all().split(4).is_none());
        assert!(t.all().split(0).is_none());
    }

    #[test]
    fn model_clock() {
        let model = IpuModel::new(16);
        assert_eq!(model.num_tiles(), 16);
        assert_eq!(model.tile_clock_frequency(), TargetDesc::ipu2().clock_hz);
    }
}
