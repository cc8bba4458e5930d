// This module implements vertex packaging: placing a codelet on a tile of a graph and binding
// its fields to tensor memory. add_vertex validates the whole request before touching the
// graph, in a fixed order: the tile index against the device, the codelet against the graph's
// registered symbols (an artifact is checked against its own signature and must not conflict
// with a different codelet registered under the same name), then every field binding for
// presence, uniqueness, direction, element type, shape and tile placement. Only a fully valid request
// registers the codelet and the vertex, so a failed call leaves the graph unchanged.
// add_vertex_across_tiles splits the vector bindings evenly over a set of tiles and adds one
// vertex per tile as a single all-or-nothing operation.

//! Vertex packaging.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codegen::{CompiledArtifact, VertexField};
use crate::core::error::BindingMismatchError;
use crate::graph::{Graph, VertexId, VertexVector};
use crate::kernel::FieldShape;

/// The codelet a vertex runs.
#[derive(Debug, Clone, Copy)]
pub enum CodeletRef<'a> {
    /// Generated code; registered with the graph on first use.
    Artifact(&'a Arc<CompiledArtifact>),
    /// A symbol already registered with the graph.
    Symbol(&'a str),
}

impl<'a> From<&'a Arc<CompiledArtifact>> for CodeletRef<'a> {
    fn from(artifact: &'a Arc<CompiledArtifact>) -> Self {
        CodeletRef::Artifact(artifact)
    }
}

impl<'a> From<&'a str> for CodeletRef<'a> {
    fn from(symbol: &'a str) -> Self {
        CodeletRef::Symbol(symbol)
    }
}

impl CodeletRef<'_> {
    pub fn symbol(&self) -> &str {
        match self {
            CodeletRef::Artifact(artifact) => &artifact.codelet,
            CodeletRef::Symbol(symbol) => symbol,
        }
    }
}

/// Add a vertex running `codelet` on `tile` with the given field bindings.
pub fn add_vertex<'a>(
    graph: &mut Graph,
    codelet: impl Into<CodeletRef<'a>>,
    tile: u32,
    bindings: &[(&str, VertexVector)],
) -> Result<VertexId, BindingMismatchError> {
    let codelet = codelet.into();
    let ordered = check_vertex(graph, codelet, tile, bindings)?;

    if let CodeletRef::Artifact(artifact) = codelet {
        graph.register_artifact(artifact);
    }
    let id = graph.push_vertex(codelet.symbol().to_string(), tile, ordered);
    log::debug!("added vertex {} running `{}` on tile {}", id, codelet.symbol(), tile);
    Ok(id)
}

/// Split every vector binding evenly over `tiles`, map each chunk to its
/// tile and add one vertex per tile. Scalar bindings are shared.
pub fn add_vertex_across_tiles<'a>(
    graph: &mut Graph,
    codelet: impl Into<CodeletRef<'a>>,
    tiles: &[u32],
    bindings: &[(&str, VertexVector)],
) -> Result<Vec<VertexId>, BindingMismatchError> {
    let codelet = codelet.into();
    let fields = resolve_fields(graph, codelet)?;
    let parts = tiles.len() as u32;

    let mut chunks = Vec::with_capacity(bindings.len());
    for (name, vector) in bindings {
        let vector_field = fields
            .iter()
            .any(|f| f.name == *name && f.shape == FieldShape::Vector);
        if !vector_field {
            chunks.push(None);
            continue;
        }
        let split = vector.allocation.split(parts).ok_or_else(|| BindingMismatchError::UnevenSplit {
            field: name.to_string(),
            len: vector.allocation.len,
            tiles: parts,
        })?;
        chunks.push(Some(split));
    }

    let mut staged = graph.clone();
    let mut ids = Vec::with_capacity(tiles.len());
    for (i, &tile) in tiles.iter().enumerate() {
        let mut per_tile = Vec::with_capacity(bindings.len());
        for ((name, vector), split) in bindings.iter().zip(&chunks) {
            let vector = match split {
                Some(split) => {
                    let chunk = split[i];
                    staged.map_allocation(&chunk, tile)?;
                    VertexVector {
                        allocation: chunk,
                        ..*vector
                    }
                }
                None => *vector,
            };
            per_tile.push((*name, vector));
        }
        ids.push(add_vertex(&mut staged, codelet, tile, &per_tile)?);
    }

    *graph = staged;
    Ok(ids)
}

/// Fields the bindings are checked against. An artifact is checked against its
/// own signature and must agree with whatever is registered under its name.
fn resolve_fields(graph: &Graph, codelet: CodeletRef<'_>) -> Result<Vec<VertexField>, BindingMismatchError> {
    let registered = graph.codelet(codelet.symbol());
    match codelet {
        CodeletRef::Artifact(artifact) => {
            if let Some(registered) = registered {
                let same_code = registered
                    .artifact
                    .as_ref()
                    .map_or(true, |known| known.fingerprint == artifact.fingerprint);
                if !same_code || registered.fields != artifact.fields {
                    return Err(BindingMismatchError::ConflictingCodelet {
                        symbol: artifact.codelet.clone(),
                    });
                }
            }
            Ok(artifact.fields.clone())
        }
        CodeletRef::Symbol(symbol) => registered
            .map(|r| r.fields.clone())
            .ok_or_else(|| BindingMismatchError::UnknownCodelet {
                symbol: symbol.to_string(),
            }),
    }
}

/// Validate a vertex request; returns the bindings in field order.
fn check_vertex(
    graph: &Graph,
    codelet: CodeletRef<'_>,
    tile: u32,
    bindings: &[(&str, VertexVector)],
) -> Result<Vec<(String, VertexVector)>, BindingMismatchError> {
    let num_tiles = graph.num_tiles();
    if tile >= num_tiles {
        return Err(BindingMismatchError::TileOutOfRange { tile, num_tiles });
    }
    let fields = resolve_fields(graph, codelet)?;
    let symbol = codelet.symbol();

    let mut seen = BTreeSet::new();
    for (name, _) in bindings {
        if !seen.insert(*name) {
            return Err(BindingMismatchError::DuplicateField {
                field: name.to_string(),
            });
        }
        if !fields.iter().any(|f| f.name == *name) {
            return Err(BindingMismatchError::UnexpectedField {
                codelet: symbol.to_string(),
                field: name.to_string(),
            });
        }
    }

    let mut ordered = Vec::with_capacity(fields.len());
    for field in &fields {
        let vector = bindings
            .iter()
            .find(|(name, _)| *name == field.name)
            .map(|(_, v)| *v)
            .ok_or_else(|| BindingMismatchError::MissingField {
                codelet: symbol.to_string(),
                field: field.name.clone(),
            })?;
        check_binding(graph, field, &vector, tile)?;
        ordered.push((field.name.clone(), vector));
    }
    Ok(ordered)
}

fn check_binding(
    graph: &Graph,
    field: &VertexField,
    vector: &VertexVector,
    tile: u32,
) -> Result<(), BindingMismatchError> {
    if vector.direction != field.direction {
        return Err(BindingMismatchError::DirectionMismatch {
            field: field.name.clone(),
            expected: field.direction,
            found: vector.direction,
        });
    }
    if vector.elem() != field.elem {
        return Err(BindingMismatchError::TypeMismatch {
            field: field.name.clone(),
            expected: field.elem,
            found: vector.elem(),
        });
    }

    let allocation = &vector.allocation;
    let info = graph.checked_tensor(allocation)?;
    if info.elem != field.elem {
        return Err(BindingMismatchError::TypeMismatch {
            field: field.name.clone(),
            expected: field.elem,
            found: info.elem,
        });
    }
    if field.shape == FieldShape::Scalar && allocation.len != 1 {
        return Err(BindingMismatchError::ShapeMismatch {
            field: field.name.clone(),
            shape: field.shape,
            len: allocation.len,
        });
    }
    if let Some(&mapped) = info
        .tiles_of(allocation.offset, allocation.end())
        .iter()
        .find(|&&t| t != tile)
    {
        return Err(BindingMismatchError::TileMismatch {
            field: field.name.clone(),
            mapped,
            tile,
        });
    }
    Ok(())
}
