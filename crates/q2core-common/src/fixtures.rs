// fixtures.rs -- tiny hand-built BSP files for tests
//
// The world is a solid 128-unit cube centred on the origin, surrounded by
// open space. The open space is split into two clusters and two areas:
// leaf 1 (x > 64) and leaf 3 (everything else). Inline model *1 is a thin
// bar spanning x in [0, 64], y and z in [-8, 8].

use crate::q_shared::{CONTENTS_SOLID, CONTENTS_WATER};
use crate::qfiles::*;

pub const WALL_TEXTURE: &str = "e1u1/wall";
pub const INLINE_HEADNODE: i32 = 6;

const WORLD_LEAF_OPEN: i32 = 1;
const WORLD_LEAF_CUBE: i32 = 2;
const WORLD_LEAF_REST: i32 = 3;
const MODEL_LEAF_OUT: i32 = 4;
const MODEL_LEAF_IN: i32 = 5;

fn leaf_child(leaf: i32) -> i32 {
    -1 - leaf
}

#[derive(Default)]
struct Lumps {
    data: [Vec<u8>; HEADER_LUMPS],
}

impl Lumps {
    fn put_i32(&mut self, lump: usize, v: i32) {
        self.data[lump].extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, lump: usize, v: f32) {
        self.data[lump].extend_from_slice(&v.to_le_bytes());
    }

    fn put_i16(&mut self, lump: usize, v: i16) {
        self.data[lump].extend_from_slice(&v.to_le_bytes());
    }

    fn put_u16(&mut self, lump: usize, v: u16) {
        self.data[lump].extend_from_slice(&v.to_le_bytes());
    }

    fn texinfo(&mut self, name: &str, flags: i32) {
        for _ in 0..8 {
            self.put_f32(LUMP_TEXINFO, 0.0);
        }
        self.put_i32(LUMP_TEXINFO, flags);
        self.put_i32(LUMP_TEXINFO, 0);
        let mut tex = [0u8; 32];
        tex[..name.len()].copy_from_slice(name.as_bytes());
        self.data[LUMP_TEXINFO].extend_from_slice(&tex);
        self.put_i32(LUMP_TEXINFO, -1);
    }

    /// Axial plane; negative normals get the "any axis" types.
    fn plane(&mut self, axis: usize, negative: bool, dist: f32) -> u16 {
        let index = self.data[LUMP_PLANES].len() / PLANE_SIZE;
        for i in 0..3 {
            let n = match (i == axis, negative) {
                (true, false) => 1.0,
                (true, true) => -1.0,
                _ => 0.0,
            };
            self.put_f32(LUMP_PLANES, n);
        }
        self.put_f32(LUMP_PLANES, dist);
        self.put_i32(LUMP_PLANES, if negative { 3 + axis as i32 } else { axis as i32 });
        index as u16
    }

    fn node(&mut self, plane: u16, front: i32, back: i32) {
        self.put_i32(LUMP_NODES, plane as i32);
        self.put_i32(LUMP_NODES, front);
        self.put_i32(LUMP_NODES, back);
        for _ in 0..6 {
            self.put_i16(LUMP_NODES, 0);
        }
        self.put_u16(LUMP_NODES, 0);
        self.put_u16(LUMP_NODES, 0);
    }

    fn leaf(&mut self, contents: i32, cluster: i16, area: i16, firstbrush: u16, numbrushes: u16) {
        self.put_i32(LUMP_LEAFS, contents);
        self.put_i16(LUMP_LEAFS, cluster);
        self.put_i16(LUMP_LEAFS, area);
        for _ in 0..6 {
            self.put_i16(LUMP_LEAFS, 0);
        }
        self.put_u16(LUMP_LEAFS, 0);
        self.put_u16(LUMP_LEAFS, 0);
        self.put_u16(LUMP_LEAFS, firstbrush);
        self.put_u16(LUMP_LEAFS, numbrushes);
    }

    fn brush(&mut self, firstside: i32, contents: i32) {
        self.put_i32(LUMP_BRUSHES, firstside);
        self.put_i32(LUMP_BRUSHES, 6);
        self.put_i32(LUMP_BRUSHES, contents);
    }

    fn brush_sides(&mut self, planes: &[u16; 6]) {
        for &p in planes {
            self.put_u16(LUMP_BRUSHSIDES, p);
            self.put_i16(LUMP_BRUSHSIDES, 0);
        }
    }

    fn model(&mut self, mins: [f32; 3], maxs: [f32; 3], headnode: i32) {
        for v in mins.iter().chain(maxs.iter()) {
            self.put_f32(LUMP_MODELS, *v);
        }
        for _ in 0..3 {
            self.put_f32(LUMP_MODELS, 0.0);
        }
        self.put_i32(LUMP_MODELS, headnode);
        self.put_i32(LUMP_MODELS, 0);
        self.put_i32(LUMP_MODELS, 0);
    }

    fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&IDBSPHEADER.to_le_bytes());
        out.extend_from_slice(&BSPVERSION.to_le_bytes());

        let mut ofs = HEADER_SIZE;
        for lump in &self.data {
            out.extend_from_slice(&(ofs as i32).to_le_bytes());
            out.extend_from_slice(&(lump.len() as i32).to_le_bytes());
            ofs += lump.len();
        }
        for lump in &self.data {
            out.extend_from_slice(lump);
        }
        out
    }
}

/// Planes for a box brush in +x, -x, +y, -y, +z, -z order.
fn box_planes(l: &mut Lumps, mins: [f32; 3], maxs: [f32; 3]) -> [u16; 6] {
    let mut out = [0; 6];
    for axis in 0..3 {
        out[axis * 2] = l.plane(axis, false, maxs[axis]);
        out[axis * 2 + 1] = l.plane(axis, true, -mins[axis]);
    }
    out
}

/// Node chain that isolates the box `mins..maxs`: each node's front side is
/// outside for a max plane, the back side outside for a min plane.
fn box_nodes(l: &mut Lumps, first_node: i32, mins: [f32; 3], maxs: [f32; 3], inside: i32, outside: i32) {
    for axis in 0..3 {
        let max_plane = l.plane(axis, false, maxs[axis]);
        let min_plane = l.plane(axis, false, mins[axis]);
        let n = first_node + axis as i32 * 2;
        l.node(max_plane, outside, n + 1);
        let back = if axis == 2 { inside } else { n + 2 };
        l.node(min_plane, back, outside);
    }
}

fn build(extra_water_brushes: usize) -> Vec<u8> {
    let mut l = Lumps::default();

    l.data[LUMP_ENTITIES] = b"{\n\"classname\" \"worldspawn\"\n\"message\" \"box room\"\n}\n\0".to_vec();
    l.texinfo(WALL_TEXTURE, 0);

    // world: nodes 0-5, solid cube in leaf 2
    let cube = ([-64.0; 3], [64.0; 3]);
    let x_max = l.plane(0, false, 64.0);
    let x_min = l.plane(0, false, -64.0);
    l.node(x_max, leaf_child(WORLD_LEAF_OPEN), 1);
    l.node(x_min, 2, leaf_child(WORLD_LEAF_REST));
    for axis in 1..3 {
        let max_plane = l.plane(axis, false, 64.0);
        let min_plane = l.plane(axis, false, -64.0);
        let n = axis as i32 * 2;
        l.node(max_plane, leaf_child(WORLD_LEAF_REST), n + 1);
        let back = if axis == 2 { leaf_child(WORLD_LEAF_CUBE) } else { n + 2 };
        l.node(min_plane, back, leaf_child(WORLD_LEAF_REST));
    }

    // inline model *1: nodes 6-11
    let bar = ([0.0, -8.0, -8.0], [64.0, 8.0, 8.0]);
    box_nodes(
        &mut l,
        INLINE_HEADNODE,
        bar.0,
        bar.1,
        leaf_child(MODEL_LEAF_IN),
        leaf_child(MODEL_LEAF_OUT),
    );

    l.leaf(CONTENTS_SOLID, -1, 0, 0, 0);
    l.leaf(0, 0, 1, 0, 0);
    l.leaf(CONTENTS_SOLID, -1, 0, 0, 1);
    l.leaf(0, 1, 2, 0, 0);
    l.leaf(0, -1, 0, 0, 0);
    l.leaf(CONTENTS_SOLID, -1, 0, 1, 1);

    l.put_u16(LUMP_LEAFBRUSHES, 0);
    l.put_u16(LUMP_LEAFBRUSHES, 1);

    let cube_planes = box_planes(&mut l, cube.0, cube.1);
    let bar_planes = box_planes(&mut l, bar.0, bar.1);
    l.brush(0, CONTENTS_SOLID);
    l.brush_sides(&cube_planes);
    l.brush(6, CONTENTS_SOLID);
    l.brush_sides(&bar_planes);
    for i in 0..extra_water_brushes {
        l.brush((i as i32 + 2) * 6, CONTENTS_WATER);
        l.brush_sides(&cube_planes);
    }

    l.model([-4096.0; 3], [4096.0; 3], 0);
    l.model(bar.0, bar.1, INLINE_HEADNODE);

    // two clusters, one-byte rows: header, then PVS0 PHS0 PVS1 PHS1
    l.put_i32(LUMP_VISIBILITY, 2);
    for ofs in [20, 21, 22, 23] {
        l.put_i32(LUMP_VISIBILITY, ofs);
    }
    l.data[LUMP_VISIBILITY].extend_from_slice(&[0x03, 0x03, 0x02, 0x03]);

    // area 0 is the outside; areas 1 and 2 share portal 1
    for (num, first) in [(0, 0), (1, 0), (1, 1)] {
        l.put_i32(LUMP_AREAS, num);
        l.put_i32(LUMP_AREAS, first);
    }
    for (portal, other) in [(1, 2), (1, 1)] {
        l.put_i32(LUMP_AREAPORTALS, portal);
        l.put_i32(LUMP_AREAPORTALS, other);
    }

    l.finish()
}

/// The box room described at the top of this file.
pub fn box_room_bsp() -> Vec<u8> {
    build(0)
}

/// The box room plus `n` water brushes that no leaf references, for
/// exercising the bulk lump decoders.
pub fn many_brushes_bsp(n: usize) -> Vec<u8> {
    build(n)
}
