// qfiles.rs -- on-disk BSP layout: header, lump directory, record strides and limits

/// BSP magic: "IBSP" in little-endian
pub const IDBSPHEADER: i32 =
    (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'I' as i32;
pub const BSPVERSION: i32 = 38;

// Upper design bounds
pub const MAX_MAP_MODELS: usize = 1024;
pub const MAX_MAP_BRUSHES: usize = 8192;
pub const MAX_MAP_ENTSTRING: usize = 0x40000;
pub const MAX_MAP_TEXINFO: usize = 8192;
pub const MAX_MAP_AREAS: usize = 256;
pub const MAX_MAP_AREAPORTALS: usize = 1024;
pub const MAX_MAP_PLANES: usize = 65536;
pub const MAX_MAP_NODES: usize = 65536;
pub const MAX_MAP_BRUSHSIDES: usize = 65536;
pub const MAX_MAP_LEAFS: usize = 65536;
pub const MAX_MAP_LEAFBRUSHES: usize = 65536;
pub const MAX_MAP_VISIBILITY: usize = 0x100000;

// Lump indices
pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_PLANES: usize = 1;
pub const LUMP_VERTEXES: usize = 2;
pub const LUMP_VISIBILITY: usize = 3;
pub const LUMP_NODES: usize = 4;
pub const LUMP_TEXINFO: usize = 5;
pub const LUMP_FACES: usize = 6;
pub const LUMP_LIGHTING: usize = 7;
pub const LUMP_LEAFS: usize = 8;
pub const LUMP_LEAFFACES: usize = 9;
pub const LUMP_LEAFBRUSHES: usize = 10;
pub const LUMP_EDGES: usize = 11;
pub const LUMP_SURFEDGES: usize = 12;
pub const LUMP_MODELS: usize = 13;
pub const LUMP_BRUSHES: usize = 14;
pub const LUMP_BRUSHSIDES: usize = 15;
pub const LUMP_POP: usize = 16;
pub const LUMP_AREAS: usize = 17;
pub const LUMP_AREAPORTALS: usize = 18;
pub const HEADER_LUMPS: usize = 19;

/// ident + version + lump directory
pub const HEADER_SIZE: usize = 8 + HEADER_LUMPS * 8;

// Record sizes of the lumps the collision model reads.
// texinfo: vecs[2][4] f32, flags, value, texture[32], nexttexinfo
pub const TEXINFO_SIZE: usize = 76;
// leaf: contents, cluster i16, area i16, mins/maxs i16x3, leafface range u16x2, leafbrush range u16x2
pub const LEAF_SIZE: usize = 28;
pub const LEAFBRUSH_SIZE: usize = 2;
// plane: normal f32x3, dist, type i32
pub const PLANE_SIZE: usize = 20;
// brush: firstside, numsides, contents
pub const BRUSH_SIZE: usize = 12;
// brushside: planenum u16, texinfo i16
pub const BRUSHSIDE_SIZE: usize = 4;
// model: mins, maxs, origin f32x3, headnode, firstface, numfaces
pub const MODEL_SIZE: usize = 48;
// node: planenum, children i32x2, mins/maxs i16x3, face range u16x2
pub const NODE_SIZE: usize = 28;
// area: numareaportals, firstareaportal
pub const AREA_SIZE: usize = 8;
// areaportal: portalnum, otherarea
pub const AREAPORTAL_SIZE: usize = 8;

/// Offset and length of one lump, in bytes from the start of the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

// Visibility lump: numclusters, then bitofs[numclusters][2], then RLE rows
pub const DVIS_PVS: usize = 0;
pub const DVIS_PHS: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DAreaPortal {
    pub portalnum: i32,
    pub otherarea: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_spells_ibsp() {
        assert_eq!(&IDBSPHEADER.to_le_bytes(), b"IBSP");
    }

    #[test]
    fn header_size() {
        assert_eq!(HEADER_SIZE, 160);
    }
}
