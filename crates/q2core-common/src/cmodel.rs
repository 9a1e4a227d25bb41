// cmodel.rs -- BSP collision model: map loading, leaf queries, box hulls, vis and area portals

use std::sync::atomic::{AtomicU64, Ordering};

use md4::{Digest, Md4};
use rayon::prelude::*;

use crate::cvar::CvarContext;
use crate::error::{CmError, CmResult};
use crate::q_shared::{
    angle_vectors, box_on_plane_side, is_zero, rotate_into_frame, vector_subtract, CModel,
    CPlane, CSurface, Vec3, CONTENTS_MONSTER, CONTENTS_SOLID, PLANE_ANYX,
};
use crate::qfiles::*;

// ============================================================
// Runtime structures
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CNode {
    pub plane: usize,
    /// negative numbers are leafs: -1 - leafnum
    pub children: [i32; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBrushSide {
    pub plane: usize,
    /// index into the surface table, `None` for the null surface
    pub surface: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CLeaf {
    pub contents: i32,
    pub cluster: i32,
    pub area: i32,
    pub firstleafbrush: u16,
    pub numleafbrushes: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBrush {
    pub contents: i32,
    pub numsides: i32,
    pub firstbrushside: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CArea {
    pub numareaportals: i32,
    pub firstareaportal: i32,
    pub floodnum: i32,
    pub floodvalid: i32,
}

/// Largest decompressed PVS/PHS row, in bytes.
pub const MAX_VIS_ROW: usize = MAX_MAP_LEAFS / 8;

/// Lumps with at least this many records are decoded on the rayon pool.
const PARALLEL_LUMP_THRESHOLD: usize = 64;

// ============================================================
// Box hull
// ============================================================

/// Six-sided tree for tracing against an axis-aligned box as if it were a
/// tiny BSP model. Built per call, so concurrent traces never share it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxHull {
    pub(crate) planes: [CPlane; 12],
    pub(crate) nodes: [CNode; 6],
    pub(crate) sides: [CBrushSide; 6],
    pub(crate) brushes: [CBrush; 1],
    /// 0 is the empty leaf, 1 holds the box brush
    pub(crate) leafs: [CLeaf; 2],
    pub(crate) leafbrushes: [u16; 1],
}

const BOX_EMPTY_LEAF: i32 = 0;
const BOX_LEAF: i32 = 1;

impl BoxHull {
    pub fn new(mins: &Vec3, maxs: &Vec3) -> Self {
        let mut planes = [CPlane::default(); 12];
        let mut nodes = [CNode::default(); 6];
        let mut sides = [CBrushSide::default(); 6];

        for i in 0..6 {
            let side = i & 1;
            let axis = i >> 1;

            sides[i].plane = i * 2 + side;

            nodes[i].plane = i * 2;
            nodes[i].children[side] = -1 - BOX_EMPTY_LEAF;
            nodes[i].children[side ^ 1] = if i != 5 { i as i32 + 1 } else { -1 - BOX_LEAF };

            let mut normal = [0.0; 3];
            normal[axis] = 1.0;
            planes[i * 2] = CPlane {
                normal,
                dist: 0.0,
                plane_type: axis as u8,
                signbits: 0,
            };
            normal[axis] = -1.0;
            planes[i * 2 + 1] = CPlane {
                normal,
                dist: 0.0,
                plane_type: PLANE_ANYX + axis as u8,
                signbits: 0,
            };
        }

        for axis in 0..3 {
            planes[axis * 4].dist = maxs[axis];
            planes[axis * 4 + 1].dist = -maxs[axis];
            planes[axis * 4 + 2].dist = mins[axis];
            planes[axis * 4 + 3].dist = -mins[axis];
        }

        Self {
            planes,
            nodes,
            sides,
            brushes: [CBrush {
                contents: CONTENTS_MONSTER,
                numsides: 6,
                firstbrushside: 0,
            }],
            leafs: [
                CLeaf::default(),
                CLeaf {
                    contents: CONTENTS_MONSTER,
                    cluster: 0,
                    area: 0,
                    firstleafbrush: 0,
                    numleafbrushes: 1,
                },
            ],
            leafbrushes: [0],
        }
    }

    pub fn plane_dists(&self) -> [f32; 12] {
        let mut d = [0.0; 12];
        for (out, p) in d.iter_mut().zip(self.planes.iter()) {
            *out = p.dist;
        }
        d
    }
}

/// Something a trace or point query can descend: a headnode of the loaded
/// map or a temporary box.
#[derive(Debug, Clone, PartialEq)]
pub enum ClipHull {
    Node(i32),
    Box(BoxHull),
}

impl ClipHull {
    pub fn is_box(&self) -> bool {
        matches!(self, ClipHull::Box(_))
    }
}

/// Borrowed view over one set of tree arrays.
#[derive(Clone, Copy)]
pub(crate) struct HullRef<'a> {
    pub planes: &'a [CPlane],
    pub nodes: &'a [CNode],
    pub leafs: &'a [CLeaf],
    pub leafbrushes: &'a [u16],
    pub brushes: &'a [CBrush],
    pub brushsides: &'a [CBrushSide],
    pub surfaces: &'a [CSurface],
    pub headnode: i32,
}

impl HullRef<'_> {
    pub fn point_leafnum_r(&self, p: &Vec3, mut num: i32) -> usize {
        while num >= 0 {
            let node = &self.nodes[num as usize];
            let d = self.planes[node.plane].distance_to(p);
            num = if d < 0.0 { node.children[1] } else { node.children[0] };
        }
        (-1 - num) as usize
    }

    pub fn box_leafnums_r(
        &self,
        mut nodenum: i32,
        mins: &Vec3,
        maxs: &Vec3,
        maxcount: usize,
        list: &mut Vec<usize>,
        topnode: &mut i32,
    ) {
        loop {
            if nodenum < 0 {
                if list.len() < maxcount {
                    list.push((-1 - nodenum) as usize);
                }
                return;
            }

            let node = &self.nodes[nodenum as usize];
            match box_on_plane_side(mins, maxs, &self.planes[node.plane]) {
                1 => nodenum = node.children[0],
                2 => nodenum = node.children[1],
                _ => {
                    // go down both
                    if *topnode == -1 {
                        *topnode = nodenum;
                    }
                    self.box_leafnums_r(node.children[0], mins, maxs, maxcount, list, topnode);
                    nodenum = node.children[1];
                }
            }
        }
    }

    pub fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, maxcount: usize) -> (Vec<usize>, i32) {
        let mut list = Vec::with_capacity(maxcount.min(64));
        let mut topnode = -1;
        self.box_leafnums_r(self.headnode, mins, maxs, maxcount, &mut list, &mut topnode);
        (list, topnode)
    }
}

// ============================================================
// Statistics
// ============================================================

/// Query counters. Relaxed atomics so tracing can stay `&self`.
#[derive(Debug, Default)]
pub struct CmStats {
    pub traces: AtomicU64,
    pub brush_traces: AtomicU64,
    pub point_contents: AtomicU64,
}

impl CmStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// (traces, brush traces, point-contents lookups)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.traces.load(Ordering::Relaxed),
            self.brush_traces.load(Ordering::Relaxed),
            self.point_contents.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.traces.store(0, Ordering::Relaxed);
        self.brush_traces.store(0, Ordering::Relaxed);
        self.point_contents.store(0, Ordering::Relaxed);
    }
}

// ============================================================
// Byte helpers
// ============================================================

#[inline]
fn read_i32(b: &[u8], ofs: usize) -> i32 {
    i32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

#[inline]
fn read_f32(b: &[u8], ofs: usize) -> f32 {
    f32::from_le_bytes([b[ofs], b[ofs + 1], b[ofs + 2], b[ofs + 3]])
}

#[inline]
fn read_u16(b: &[u8], ofs: usize) -> u16 {
    u16::from_le_bytes([b[ofs], b[ofs + 1]])
}

#[inline]
fn read_i16(b: &[u8], ofs: usize) -> i16 {
    i16::from_le_bytes([b[ofs], b[ofs + 1]])
}

/// MD4 of the whole file, folded to 32 bits by XOR of the digest words.
pub fn block_checksum(data: &[u8]) -> u32 {
    let digest = Md4::digest(data);
    digest
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0, |acc, w| acc ^ w)
}

/// Bounds-checked byte range of one lump.
fn lump_bytes<'a>(data: &'a [u8], lump: &Lump, name: &'static str) -> CmResult<&'a [u8]> {
    let out_of_range = || CmError::LumpOutOfRange {
        lump: name,
        ofs: lump.fileofs,
        len: lump.filelen,
    };
    if lump.fileofs < 0 || lump.filelen < 0 {
        return Err(out_of_range());
    }
    let ofs = lump.fileofs as usize;
    let end = ofs.checked_add(lump.filelen as usize).ok_or_else(out_of_range)?;
    data.get(ofs..end).ok_or_else(out_of_range)
}

/// Splits a lump into fixed-size records and decodes each one, in parallel
/// when the lump is large. Both paths yield the same order.
fn decode_records<T, F>(
    bytes: &[u8],
    stride: usize,
    name: &'static str,
    max: usize,
    decode: F,
) -> CmResult<Vec<T>>
where
    T: Send,
    F: Fn(&[u8]) -> T + Sync + Send,
{
    if bytes.len() % stride != 0 {
        return Err(CmError::FunnyLumpSize(name));
    }
    let count = bytes.len() / stride;
    if count > max {
        return Err(CmError::TooMany { what: name, count, max });
    }

    let records = if count >= PARALLEL_LUMP_THRESHOLD {
        bytes.par_chunks_exact(stride).map(&decode).collect()
    } else {
        bytes.chunks_exact(stride).map(&decode).collect()
    };
    Ok(records)
}

fn require_some<T>(v: &[T], name: &'static str) -> CmResult<()> {
    if v.is_empty() {
        Err(CmError::Empty(name))
    } else {
        Ok(())
    }
}

fn bad_ref(what: &'static str, index: impl Into<i64>) -> CmError {
    CmError::BadReference {
        what,
        index: index.into(),
    }
}

// ============================================================
// Collision model
// ============================================================

/// All per-level collision state. Immutable after `load_map` apart from
/// area-portal state; every query takes `&self`.
#[derive(Debug)]
pub struct CModelContext {
    pub map_name: String,
    last_checksum: u32,

    pub map_surfaces: Vec<CSurface>,
    pub map_planes: Vec<CPlane>,
    pub map_nodes: Vec<CNode>,
    pub map_leafs: Vec<CLeaf>,
    pub map_leafbrushes: Vec<u16>,
    pub map_cmodels: Vec<CModel>,
    pub map_brushes: Vec<CBrush>,
    pub map_brushsides: Vec<CBrushSide>,
    pub map_visibility: Vec<u8>,
    /// per cluster: [PVS offset, PHS offset] into `map_visibility`
    pub vis_bitofs: Vec<[i32; 2]>,
    pub map_entitystring: String,
    pub map_areas: Vec<CArea>,
    pub map_areaportals: Vec<DAreaPortal>,

    pub numclusters: usize,
    pub emptyleaf: i32,

    pub(crate) nullsurface: CSurface,

    floodvalid: i32,
    pub portalopen: Vec<bool>,

    /// mirrors the `map_noareas` cvar
    pub map_noareas: bool,

    pub stats: CmStats,
}

impl Default for CModelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CModelContext {
    pub fn new() -> Self {
        Self {
            map_name: String::new(),
            last_checksum: 0,
            map_surfaces: Vec::new(),
            map_planes: Vec::new(),
            map_nodes: Vec::new(),
            // allow leaf funcs to be called without a map
            map_leafs: vec![CLeaf::default()],
            map_leafbrushes: Vec::new(),
            map_cmodels: vec![CModel::default()],
            map_brushes: Vec::new(),
            map_brushsides: Vec::new(),
            map_visibility: Vec::new(),
            vis_bitofs: Vec::new(),
            map_entitystring: String::new(),
            map_areas: vec![CArea::default()],
            map_areaportals: Vec::new(),
            numclusters: 1,
            emptyleaf: -1,
            nullsurface: CSurface::default(),
            floodvalid: 0,
            portalopen: vec![false; MAX_MAP_AREAPORTALS],
            map_noareas: false,
            stats: CmStats::default(),
        }
    }

    pub fn apply_cvars(&mut self, cvars: &CvarContext) {
        self.map_noareas = cvars.variable_value("map_noareas") != 0.0;
    }

    // ============================================================
    // Lump loaders
    // ============================================================

    fn load_surfaces(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "texinfo")?;
        // vecs[2][4] at 0, flags at 32, value at 36, texture[32] at 40
        self.map_surfaces = decode_records(bytes, TEXINFO_SIZE, "texinfo", MAX_MAP_TEXINFO, |b| {
            let mut surf = CSurface {
                flags: read_i32(b, 32),
                value: read_i32(b, 36),
                ..CSurface::default()
            };
            let tex = &b[40..72];
            let len = tex.iter().position(|&c| c == 0).unwrap_or(32).min(15);
            surf.name[..len].copy_from_slice(&tex[..len]);
            surf
        })?;
        require_some(&self.map_surfaces, "surfaces")
    }

    fn load_leafs(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "leafs")?;
        self.map_leafs = decode_records(bytes, LEAF_SIZE, "leafs", MAX_MAP_LEAFS, |b| CLeaf {
            contents: read_i32(b, 0),
            cluster: read_i16(b, 4) as i32,
            area: read_i16(b, 6) as i32,
            firstleafbrush: read_u16(b, 24),
            numleafbrushes: read_u16(b, 26),
        })?;
        require_some(&self.map_leafs, "leafs")?;

        self.numclusters = self
            .map_leafs
            .iter()
            .map(|l| if l.cluster >= 0 { l.cluster as usize + 1 } else { 0 })
            .max()
            .unwrap_or(0);

        if self.map_leafs[0].contents != CONTENTS_SOLID {
            return Err(CmError::Leaf0NotSolid);
        }
        self.emptyleaf = self
            .map_leafs
            .iter()
            .skip(1)
            .position(|l| l.contents == 0)
            .map(|i| i as i32 + 1)
            .ok_or(CmError::NoEmptyLeaf)?;
        Ok(())
    }

    fn load_leaf_brushes(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "leafbrushes")?;
        self.map_leafbrushes = decode_records(
            bytes,
            LEAFBRUSH_SIZE,
            "leafbrushes",
            MAX_MAP_LEAFBRUSHES,
            |b| read_u16(b, 0),
        )?;
        require_some(&self.map_leafbrushes, "leafbrushes")
    }

    fn load_planes(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "planes")?;
        self.map_planes = decode_records(bytes, PLANE_SIZE, "planes", MAX_MAP_PLANES, |b| {
            CPlane::new(
                [read_f32(b, 0), read_f32(b, 4), read_f32(b, 8)],
                read_f32(b, 12),
                read_i32(b, 16) as u8,
            )
        })?;
        require_some(&self.map_planes, "planes")
    }

    fn load_brushes(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "brushes")?;
        self.map_brushes = decode_records(bytes, BRUSH_SIZE, "brushes", MAX_MAP_BRUSHES, |b| {
            CBrush {
                firstbrushside: read_i32(b, 0),
                numsides: read_i32(b, 4),
                contents: read_i32(b, 8),
            }
        })?;
        Ok(())
    }

    fn load_brush_sides(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "brushsides")?;
        let raw = decode_records(
            bytes,
            BRUSHSIDE_SIZE,
            "brushsides",
            MAX_MAP_BRUSHSIDES,
            |b| (read_u16(b, 0) as usize, read_i16(b, 2)),
        )?;

        let numtexinfo = self.map_surfaces.len();
        self.map_brushsides = raw
            .into_iter()
            .enumerate()
            .map(|(i, (plane, texinfo))| {
                if texinfo as i32 >= numtexinfo as i32 {
                    return Err(CmError::BadBrushSideTexinfo {
                        side: i,
                        texinfo: texinfo as i32,
                    });
                }
                Ok(CBrushSide {
                    plane,
                    surface: (texinfo >= 0).then_some(texinfo as usize),
                })
            })
            .collect::<CmResult<Vec<_>>>()?;
        Ok(())
    }

    fn load_submodels(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "submodels")?;
        self.map_cmodels = decode_records(bytes, MODEL_SIZE, "models", MAX_MAP_MODELS, |b| {
            let mut cm = CModel::default();
            for j in 0..3 {
                // spread the mins / maxs by a pixel
                cm.mins[j] = read_f32(b, j * 4) - 1.0;
                cm.maxs[j] = read_f32(b, 12 + j * 4) + 1.0;
                cm.origin[j] = read_f32(b, 24 + j * 4);
            }
            cm.headnode = read_i32(b, 36);
            cm
        })?;
        require_some(&self.map_cmodels, "models")
    }

    fn load_nodes(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "nodes")?;
        let raw = decode_records(bytes, NODE_SIZE, "nodes", MAX_MAP_NODES, |b| {
            (read_i32(b, 0), [read_i32(b, 4), read_i32(b, 8)])
        })?;
        require_some(&raw, "nodes")?;

        self.map_nodes = raw
            .into_iter()
            .map(|(plane, children)| {
                if plane < 0 {
                    return Err(bad_ref("node plane", plane));
                }
                Ok(CNode {
                    plane: plane as usize,
                    children,
                })
            })
            .collect::<CmResult<Vec<_>>>()?;
        Ok(())
    }

    fn load_areas(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "areas")?;
        self.map_areas = decode_records(bytes, AREA_SIZE, "areas", MAX_MAP_AREAS, |b| CArea {
            numareaportals: read_i32(b, 0),
            firstareaportal: read_i32(b, 4),
            floodnum: 0,
            floodvalid: 0,
        })?;
        Ok(())
    }

    fn load_area_portals(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "areaportals")?;
        self.map_areaportals = decode_records(
            bytes,
            AREAPORTAL_SIZE,
            "areaportals",
            MAX_MAP_AREAPORTALS,
            |b| DAreaPortal {
                portalnum: read_i32(b, 0),
                otherarea: read_i32(b, 4),
            },
        )?;
        Ok(())
    }

    fn load_visibility(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "visibility")?;
        if bytes.len() > MAX_MAP_VISIBILITY {
            return Err(CmError::TooMany {
                what: "visibility bytes",
                count: bytes.len(),
                max: MAX_MAP_VISIBILITY,
            });
        }

        self.map_visibility = bytes.to_vec();
        self.vis_bitofs.clear();
        if bytes.len() < 4 {
            return Ok(());
        }

        let numclusters = read_i32(bytes, 0);
        if numclusters < 0 || 4 + numclusters as usize * 8 > bytes.len() {
            return Err(bad_ref("vis cluster count", numclusters));
        }
        for i in 0..numclusters as usize {
            let base = 4 + i * 8;
            let ofs = [read_i32(bytes, base), read_i32(bytes, base + 4)];
            for o in ofs {
                if o < 0 || o as usize > bytes.len() {
                    return Err(bad_ref("vis offset", o));
                }
            }
            self.vis_bitofs.push(ofs);
        }
        Ok(())
    }

    fn load_entity_string(&mut self, data: &[u8], lump: &Lump) -> CmResult<()> {
        let bytes = lump_bytes(data, lump, "entities")?;
        if bytes.len() > MAX_MAP_ENTSTRING {
            return Err(CmError::TooMany {
                what: "entity chars",
                count: bytes.len(),
                max: MAX_MAP_ENTSTRING,
            });
        }
        let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
        self.map_entitystring = String::from_utf8_lossy(&bytes[..end]).into_owned();
        Ok(())
    }

    /// Every index stored in the tree arrays must land inside its target array.
    fn validate_references(&self) -> CmResult<()> {
        let numplanes = self.map_planes.len();
        let numnodes = self.map_nodes.len() as i64;
        let numleafs = self.map_leafs.len() as i64;
        let child_ok = |c: i32| {
            let c = c as i64;
            if c >= 0 { c < numnodes } else { -1 - c < numleafs }
        };

        for node in &self.map_nodes {
            if node.plane >= numplanes {
                return Err(bad_ref("node plane", node.plane as i64));
            }
            for &c in &node.children {
                if !child_ok(c) {
                    return Err(bad_ref("node child", c));
                }
            }
        }

        for leaf in &self.map_leafs {
            let end = leaf.firstleafbrush as usize + leaf.numleafbrushes as usize;
            if end > self.map_leafbrushes.len() {
                return Err(bad_ref("leaf brush range", end as i64));
            }
        }

        for &lb in &self.map_leafbrushes {
            if lb as usize >= self.map_brushes.len() {
                return Err(bad_ref("leafbrush", lb));
            }
        }

        for brush in &self.map_brushes {
            let end = brush.firstbrushside as i64 + brush.numsides as i64;
            if brush.firstbrushside < 0
                || brush.numsides < 0
                || end > self.map_brushsides.len() as i64
            {
                return Err(bad_ref("brush side range", end));
            }
        }

        for side in &self.map_brushsides {
            if side.plane >= numplanes {
                return Err(bad_ref("brushside plane", side.plane as i64));
            }
        }

        for model in &self.map_cmodels {
            if !child_ok(model.headnode) {
                return Err(bad_ref("model headnode", model.headnode));
            }
        }

        for area in &self.map_areas {
            let end = area.firstareaportal as i64 + area.numareaportals as i64;
            if area.firstareaportal < 0
                || area.numareaportals < 0
                || end > self.map_areaportals.len() as i64
            {
                return Err(bad_ref("area portal range", end));
            }
        }

        for portal in &self.map_areaportals {
            if portal.otherarea < 0 || portal.otherarea as usize >= self.map_areas.len() {
                return Err(bad_ref("areaportal area", portal.otherarea));
            }
            if portal.portalnum < 0 || portal.portalnum as usize >= MAX_MAP_AREAPORTALS {
                return Err(bad_ref("areaportal number", portal.portalnum));
            }
        }

        Ok(())
    }

    /// The box hull used to live at the end of the map arrays; the limits
    /// still reserve its slots.
    fn check_box_hull_room(&self) -> CmResult<()> {
        if self.map_nodes.len() + 6 > MAX_MAP_NODES
            || self.map_brushes.len() + 1 > MAX_MAP_BRUSHES
            || self.map_leafbrushes.len() + 1 > MAX_MAP_LEAFBRUSHES
            || self.map_brushsides.len() + 6 > MAX_MAP_BRUSHSIDES
            || self.map_planes.len() + 12 > MAX_MAP_PLANES
        {
            return Err(CmError::NoRoomForBoxHull);
        }
        Ok(())
    }

    fn clear_map(&mut self) {
        self.map_name.clear();
        self.last_checksum = 0;
        self.map_surfaces.clear();
        self.map_planes.clear();
        self.map_nodes.clear();
        self.map_leafs = vec![CLeaf::default()];
        self.map_leafbrushes.clear();
        self.map_cmodels = vec![CModel::default()];
        self.map_brushes.clear();
        self.map_brushsides.clear();
        self.map_visibility.clear();
        self.vis_bitofs.clear();
        self.map_entitystring.clear();
        self.map_areas = vec![CArea::default()];
        self.map_areaportals.clear();
        self.numclusters = 1;
        self.emptyleaf = -1;
    }

    // ============================================================
    // Map load
    // ============================================================

    /// Loads a map from raw file bytes and returns the world model and the
    /// file checksum. An empty `name` clears the map to a one-leaf stub.
    pub fn load_map(
        &mut self,
        name: &str,
        clientload: bool,
        buf: Option<&[u8]>,
    ) -> CmResult<(CModel, u32)> {
        if !name.is_empty() && self.map_name == name {
            if !clientload {
                self.portalopen.fill(false);
                self.flood_area_connections();
            }
            return Ok((self.map_cmodels[0], self.last_checksum));
        }

        self.clear_map();

        if name.is_empty() {
            return Ok((self.map_cmodels[0], 0));
        }

        let data = buf.ok_or_else(|| CmError::CouldNotLoad(name.to_string()))?;
        if let Err(e) = self.parse_map(name, data) {
            self.clear_map();
            return Err(e);
        }

        let checksum = block_checksum(data);
        self.last_checksum = checksum;
        self.portalopen.fill(false);
        self.flood_area_connections();
        self.map_name = name.to_string();

        log::info!(
            "loaded {}: {} planes, {} nodes, {} leafs, {} brushes, {} models, {} clusters, {} areas",
            name,
            self.map_planes.len(),
            self.map_nodes.len(),
            self.map_leafs.len(),
            self.map_brushes.len(),
            self.map_cmodels.len(),
            self.numclusters,
            self.map_areas.len()
        );

        Ok((self.map_cmodels[0], checksum))
    }

    fn parse_map(&mut self, name: &str, data: &[u8]) -> CmResult<()> {
        if data.len() < HEADER_SIZE {
            return Err(CmError::TooShort(name.to_string()));
        }
        let ident = read_i32(data, 0);
        if ident != IDBSPHEADER {
            return Err(CmError::BadIdent {
                name: name.to_string(),
                found: ident,
            });
        }
        let version = read_i32(data, 4);
        if version != BSPVERSION {
            return Err(CmError::WrongVersion {
                name: name.to_string(),
                found: version,
                expected: BSPVERSION,
            });
        }

        let mut lumps = [Lump::default(); HEADER_LUMPS];
        for (i, lump) in lumps.iter_mut().enumerate() {
            let base = 8 + i * 8;
            lump.fileofs = read_i32(data, base);
            lump.filelen = read_i32(data, base + 4);
        }

        self.load_surfaces(data, &lumps[LUMP_TEXINFO])?;
        self.load_leafs(data, &lumps[LUMP_LEAFS])?;
        self.load_leaf_brushes(data, &lumps[LUMP_LEAFBRUSHES])?;
        self.load_planes(data, &lumps[LUMP_PLANES])?;
        self.load_brushes(data, &lumps[LUMP_BRUSHES])?;
        self.load_brush_sides(data, &lumps[LUMP_BRUSHSIDES])?;
        self.load_submodels(data, &lumps[LUMP_MODELS])?;
        self.load_nodes(data, &lumps[LUMP_NODES])?;
        self.load_areas(data, &lumps[LUMP_AREAS])?;
        self.load_area_portals(data, &lumps[LUMP_AREAPORTALS])?;
        self.load_visibility(data, &lumps[LUMP_VISIBILITY])?;
        self.load_entity_string(data, &lumps[LUMP_ENTITIES])?;

        self.validate_references()?;
        self.check_box_hull_room()?;

        log::debug!(
            "{}: {} surfaces, {} brushsides, {} leafbrushes, {} areaportals, {} vis bytes",
            name,
            self.map_surfaces.len(),
            self.map_brushsides.len(),
            self.map_leafbrushes.len(),
            self.map_areaportals.len(),
            self.map_visibility.len()
        );
        Ok(())
    }

    // ============================================================
    // Accessors
    // ============================================================

    /// Looks up `*N` for `N` in `1..num_inline_models()`.
    pub fn inline_model(&self, name: &str) -> CmResult<&CModel> {
        let digits = name
            .strip_prefix('*')
            .ok_or_else(|| CmError::BadInlineModelName(name.to_string()))?;
        let num: i64 = digits
            .parse()
            .map_err(|_| CmError::BadInlineModelName(name.to_string()))?;
        if num < 1 || num as usize >= self.map_cmodels.len() {
            return Err(CmError::BadInlineModelNumber(num));
        }
        Ok(&self.map_cmodels[num as usize])
    }

    pub fn num_clusters(&self) -> usize {
        self.numclusters
    }

    pub fn num_inline_models(&self) -> usize {
        self.map_cmodels.len()
    }

    pub fn num_areas(&self) -> usize {
        self.map_areas.len()
    }

    pub fn entity_string(&self) -> &str {
        &self.map_entitystring
    }

    pub fn checksum(&self) -> u32 {
        self.last_checksum
    }

    fn leaf(&self, leafnum: usize) -> CmResult<&CLeaf> {
        self.map_leafs.get(leafnum).ok_or(CmError::BadLeafNum(leafnum))
    }

    pub fn leaf_contents(&self, leafnum: usize) -> CmResult<i32> {
        Ok(self.leaf(leafnum)?.contents)
    }

    pub fn leaf_cluster(&self, leafnum: usize) -> CmResult<i32> {
        Ok(self.leaf(leafnum)?.cluster)
    }

    pub fn leaf_area(&self, leafnum: usize) -> CmResult<i32> {
        Ok(self.leaf(leafnum)?.area)
    }

    /// Tree view of the map arrays rooted at `headnode`, or of a box hull.
    pub(crate) fn hull_ref<'a>(&'a self, hull: &'a ClipHull) -> HullRef<'a> {
        match hull {
            ClipHull::Node(headnode) => HullRef {
                planes: &self.map_planes,
                nodes: &self.map_nodes,
                leafs: &self.map_leafs,
                leafbrushes: &self.map_leafbrushes,
                brushes: &self.map_brushes,
                brushsides: &self.map_brushsides,
                surfaces: &self.map_surfaces,
                headnode: *headnode,
            },
            ClipHull::Box(b) => HullRef {
                planes: &b.planes,
                nodes: &b.nodes,
                leafs: &b.leafs,
                leafbrushes: &b.leafbrushes,
                brushes: &b.brushes,
                brushsides: &b.sides,
                surfaces: &[],
                headnode: 0,
            },
        }
    }

    /// Box hull for tracing against an entity's bounding box.
    pub fn headnode_for_box(&self, mins: &Vec3, maxs: &Vec3) -> ClipHull {
        ClipHull::Box(BoxHull::new(mins, maxs))
    }

    /// Root of inline model or world model `index`.
    pub fn model_hull(&self, index: usize) -> Option<ClipHull> {
        self.map_cmodels.get(index).map(|m| ClipHull::Node(m.headnode))
    }

    // ============================================================
    // Point / leaf queries
    // ============================================================

    pub fn point_leafnum_r(&self, p: &Vec3, headnode: i32) -> usize {
        CmStats::bump(&self.stats.point_contents);
        self.hull_ref(&ClipHull::Node(headnode)).point_leafnum_r(p, headnode)
    }

    pub fn point_leafnum(&self, p: &Vec3) -> usize {
        if self.map_planes.is_empty() {
            return 0;
        }
        self.point_leafnum_r(p, self.map_cmodels[0].headnode)
    }

    /// Leafs touched by the box below `headnode`, capped at `maxcount`, and
    /// the first node where the box straddled a plane (-1 if none).
    pub fn box_leafnums_headnode(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        maxcount: usize,
        headnode: i32,
    ) -> (Vec<usize>, i32) {
        if self.map_nodes.is_empty() {
            return (if maxcount > 0 { vec![0] } else { Vec::new() }, -1);
        }
        self.hull_ref(&ClipHull::Node(headnode)).box_leafnums(mins, maxs, maxcount)
    }

    pub fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, maxcount: usize) -> (Vec<usize>, i32) {
        self.box_leafnums_headnode(mins, maxs, maxcount, self.map_cmodels[0].headnode)
    }

    pub fn point_contents(&self, p: &Vec3, headnode: i32) -> i32 {
        if self.map_nodes.is_empty() {
            return 0;
        }
        let l = self.point_leafnum_r(p, headnode);
        self.map_leafs[l].contents
    }

    /// Contents of `p` against a hull placed at `origin` and rotated by
    /// `angles`. Box hulls are never rotated.
    pub fn transformed_point_contents(
        &self,
        p: &Vec3,
        hull: &ClipHull,
        origin: &Vec3,
        angles: &Vec3,
    ) -> i32 {
        let mut p_l = vector_subtract(p, origin);

        if !hull.is_box() && !is_zero(angles) {
            let (forward, right, up) = angle_vectors(angles);
            p_l = rotate_into_frame(&p_l, &forward, &right, &up);
        }

        if let ClipHull::Node(_) = hull {
            if self.map_nodes.is_empty() {
                return 0;
            }
        }
        CmStats::bump(&self.stats.point_contents);
        let view = self.hull_ref(hull);
        let l = view.point_leafnum_r(&p_l, view.headnode);
        view.leafs[l].contents
    }

    // ============================================================
    // PVS / PHS
    // ============================================================

    pub fn vis_row_size(&self) -> usize {
        (self.numclusters + 7) >> 3
    }

    fn cluster_vis<'a>(&self, cluster: i32, which: usize, out: &'a mut [u8]) -> &'a [u8] {
        let row = self.vis_row_size().min(out.len());
        if cluster < 0 {
            out[..row].fill(0);
        } else {
            let offset = self
                .vis_bitofs
                .get(cluster as usize)
                .map_or(0, |ofs| ofs[which] as usize);
            decompress_vis(&self.map_visibility, offset, row, &mut out[..row]);
        }
        &out[..row]
    }

    /// Decompressed potentially-visible row for `cluster` (-1 gives all zeros).
    pub fn cluster_pvs<'a>(&self, cluster: i32, out: &'a mut [u8]) -> &'a [u8] {
        self.cluster_vis(cluster, DVIS_PVS, out)
    }

    /// Decompressed potentially-hearable row for `cluster`.
    pub fn cluster_phs<'a>(&self, cluster: i32, out: &'a mut [u8]) -> &'a [u8] {
        self.cluster_vis(cluster, DVIS_PHS, out)
    }

    // ============================================================
    // Area portals
    // ============================================================

    fn flood_area_r(&mut self, area: usize, floodnum: i32) {
        let a = &mut self.map_areas[area];
        if a.floodvalid == self.floodvalid {
            if a.floodnum != floodnum {
                log::warn!("flood_area_r: reflooded area {}", area);
            }
            return;
        }
        a.floodnum = floodnum;
        a.floodvalid = self.floodvalid;

        let first = a.firstareaportal as usize;
        let count = a.numareaportals as usize;
        for i in first..first + count {
            let portal = self.map_areaportals[i];
            if self.portalopen[portal.portalnum as usize] {
                self.flood_area_r(portal.otherarea as usize, floodnum);
            }
        }
    }

    /// Recomputes the flood number of every area from the open portals.
    pub fn flood_area_connections(&mut self) {
        // all current floods are now invalid
        self.floodvalid += 1;
        let mut floodnum = 0;

        // area 0 is not used
        for i in 1..self.map_areas.len() {
            if self.map_areas[i].floodvalid == self.floodvalid {
                continue;
            }
            floodnum += 1;
            self.flood_area_r(i, floodnum);
        }
    }

    pub fn set_area_portal_state(&mut self, portalnum: usize, open: bool) -> CmResult<()> {
        if portalnum > self.map_areaportals.len() {
            return Err(CmError::BadPortalNum(portalnum));
        }
        let Some(slot) = self.portalopen.get_mut(portalnum) else {
            return Err(CmError::BadPortalNum(portalnum));
        };
        *slot = open;
        self.flood_area_connections();
        Ok(())
    }

    pub fn areas_connected(&self, area1: usize, area2: usize) -> CmResult<bool> {
        if self.map_noareas {
            return Ok(true);
        }
        let numareas = self.map_areas.len();
        if area1 >= numareas {
            return Err(CmError::BadAreaNum(area1));
        }
        if area2 >= numareas {
            return Err(CmError::BadAreaNum(area2));
        }
        Ok(self.map_areas[area1].floodnum == self.map_areas[area2].floodnum)
    }

    /// Writes a bit vector of all the areas in the same flood as `area`
    /// (every area when `area` is 0). Returns the number of bytes used.
    pub fn write_area_bits(&self, buffer: &mut [u8], area: usize) -> CmResult<usize> {
        let numareas = self.map_areas.len();
        let bytes = ((numareas + 7) >> 3).min(buffer.len());

        if self.map_noareas {
            // for debugging, send everything
            buffer[..bytes].fill(0xff);
            return Ok(bytes);
        }

        let floodnum = match self.map_areas.get(area) {
            Some(a) => a.floodnum,
            None if area == 0 => 0,
            None => return Err(CmError::BadAreaNum(area)),
        };
        buffer[..bytes].fill(0);
        for (i, a) in self.map_areas.iter().enumerate() {
            if (area == 0 || a.floodnum == floodnum) && (i >> 3) < bytes {
                buffer[i >> 3] |= 1 << (i & 7);
            }
        }
        Ok(bytes)
    }

    /// True if any leaf under `nodenum` is in a cluster set in `visbits`.
    pub fn headnode_visible(&self, nodenum: i32, visbits: &[u8]) -> bool {
        if nodenum < 0 {
            let Some(leaf) = self.map_leafs.get((-1 - nodenum) as usize) else {
                return false;
            };
            let cluster = leaf.cluster;
            if cluster < 0 {
                return false;
            }
            return visbits
                .get((cluster >> 3) as usize)
                .is_some_and(|&b| b & (1 << (cluster & 7)) != 0);
        }

        let Some(node) = self.map_nodes.get(nodenum as usize) else {
            return false;
        };
        self.headnode_visible(node.children[0], visbits)
            || self.headnode_visible(node.children[1], visbits)
    }
}

/// Expands one RLE row starting at `offset` into `out[..row]`. A zero byte
/// is followed by a count of zero bytes; anything else is literal. Without
/// vis data every cluster is visible.
pub fn decompress_vis(vis: &[u8], offset: usize, row: usize, out: &mut [u8]) {
    let row = row.min(out.len());

    if offset == 0 || vis.is_empty() {
        out[..row].fill(0xff);
        return;
    }

    let mut inp = offset;
    let mut outp = 0;
    while outp < row {
        let Some(&b) = vis.get(inp) else {
            break;
        };
        if b != 0 {
            out[outp] = b;
            outp += 1;
            inp += 1;
            continue;
        }

        let Some(&run) = vis.get(inp + 1) else {
            break;
        };
        inp += 2;
        let mut c = run as usize;
        if outp + c > row {
            c = row - outp;
            log::warn!("vis decompression overrun");
        }
        out[outp..outp + c].fill(0);
        outp += c;
    }

    // a truncated row reads as not visible
    out[outp..row].fill(0);
}
