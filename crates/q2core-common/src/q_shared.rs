// q_shared.rs -- types, constants and vector math shared by collision, movement and the server

use bitflags::bitflags;

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

pub const PITCH: usize = 0; // up / down
pub const YAW: usize = 1; // left / right
pub const ROLL: usize = 2; // fall over

// ============================================================
// Limits
// ============================================================

pub const MAX_EDICTS: usize = 1024;
pub const MAX_ENT_CLUSTERS: usize = 16;
pub const MAX_CLIP_PLANES: usize = 5;

// ============================================================
// Contents flags (brush and leaf)
// ============================================================

pub const CONTENTS_SOLID: i32 = 1;
pub const CONTENTS_WINDOW: i32 = 2;
pub const CONTENTS_AUX: i32 = 4;
pub const CONTENTS_LAVA: i32 = 8;
pub const CONTENTS_SLIME: i32 = 16;
pub const CONTENTS_WATER: i32 = 32;
pub const CONTENTS_MIST: i32 = 64;

pub const CONTENTS_AREAPORTAL: i32 = 0x8000;
pub const CONTENTS_PLAYERCLIP: i32 = 0x10000;
pub const CONTENTS_MONSTERCLIP: i32 = 0x20000;

// currents can be added to any other contents, and may be mixed
pub const CONTENTS_CURRENT_0: i32 = 0x40000;
pub const CONTENTS_CURRENT_90: i32 = 0x80000;
pub const CONTENTS_CURRENT_180: i32 = 0x100000;
pub const CONTENTS_CURRENT_270: i32 = 0x200000;
pub const CONTENTS_CURRENT_UP: i32 = 0x400000;
pub const CONTENTS_CURRENT_DOWN: i32 = 0x800000;

pub const CONTENTS_ORIGIN: i32 = 0x1000000;
pub const CONTENTS_MONSTER: i32 = 0x2000000;
pub const CONTENTS_DEADMONSTER: i32 = 0x4000000;
pub const CONTENTS_DETAIL: i32 = 0x8000000;
pub const CONTENTS_TRANSLUCENT: i32 = 0x10000000;
pub const CONTENTS_LADDER: i32 = 0x20000000;

// ============================================================
// Surface flags
// ============================================================

pub const SURF_LIGHT: i32 = 0x1;
pub const SURF_SLICK: i32 = 0x2;
pub const SURF_SKY: i32 = 0x4;
pub const SURF_WARP: i32 = 0x8;
pub const SURF_NODRAW: i32 = 0x80;

// ============================================================
// Content masks
// ============================================================

pub const MASK_ALL: i32 = -1;
pub const MASK_SOLID: i32 = CONTENTS_SOLID | CONTENTS_WINDOW;
pub const MASK_PLAYERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_DEADSOLID: i32 = CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW;
pub const MASK_MONSTERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_MONSTERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_WATER: i32 = CONTENTS_WATER | CONTENTS_LAVA | CONTENTS_SLIME;
pub const MASK_OPAQUE: i32 = CONTENTS_SOLID | CONTENTS_SLIME | CONTENTS_LAVA;
pub const MASK_SHOT: i32 =
    CONTENTS_SOLID | CONTENTS_MONSTER | CONTENTS_WINDOW | CONTENTS_DEADMONSTER;
pub const MASK_CURRENT: i32 = CONTENTS_CURRENT_0
    | CONTENTS_CURRENT_90
    | CONTENTS_CURRENT_180
    | CONTENTS_CURRENT_270
    | CONTENTS_CURRENT_UP
    | CONTENTS_CURRENT_DOWN;

/// Which membership list of the area tree a query walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaType {
    Solid,
    Triggers,
}

// ============================================================
// Plane
// ============================================================

/// Plane types. 0-2 are axial planes with a positive normal, 3-5 are
/// "any" planes whose normal is closest to that axis.
pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_NON_AXIAL: u8 = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    /// bit j set when normal[j] < 0, for the fast box-on-plane test
    pub signbits: u8,
}

impl CPlane {
    pub fn new(normal: Vec3, dist: f32, plane_type: u8) -> Self {
        Self {
            normal,
            dist,
            plane_type,
            signbits: signbits_for_normal(&normal),
        }
    }

    /// Signed distance of `p` from the plane, taking the axial shortcut when possible.
    #[inline]
    pub fn distance_to(&self, p: &Vec3) -> f32 {
        if self.plane_type < 3 {
            p[self.plane_type as usize] - self.dist
        } else {
            dot_product(&self.normal, p) - self.dist
        }
    }
}

pub fn signbits_for_normal(normal: &Vec3) -> u8 {
    let mut bits = 0u8;
    for (j, &n) in normal.iter().enumerate() {
        if n < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

// ============================================================
// Collision model / surface
// ============================================================

/// Bounding volume and root node of one BSP model. Model 0 is the world.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub headnode: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CSurface {
    pub name: [u8; 16],
    pub flags: i32,
    pub value: i32,
}

impl CSurface {
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

// ============================================================
// Trace
// ============================================================

/// Result of sweeping a box through the world.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// the whole move was inside a solid
    pub allsolid: bool,
    /// the start point was inside a solid
    pub startsolid: bool,
    /// portion of the move completed, 1.0 = nothing hit
    pub fraction: f32,
    pub endpos: Vec3,
    /// surface normal at impact
    pub plane: CPlane,
    pub surface: Option<CSurface>,
    /// contents of the brush that was hit
    pub contents: i32,
    /// entity that was hit; `Some(0)` is the world. The collision model itself
    /// never sets this, move clipping does.
    pub ent: Option<usize>,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: CPlane::default(),
            surface: None,
            contents: 0,
            ent: None,
        }
    }
}

// ============================================================
// Player movement types
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PmType {
    #[default]
    Normal,
    Spectator,
    // no acceleration or turning
    Dead,
    Gib,
    Freeze,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PmFlags: u8 {
        const DUCKED         = 1;
        const JUMP_HELD      = 2;
        const ON_GROUND      = 4;
        /// pm_time is waterjump
        const TIME_WATERJUMP = 8;
        /// pm_time is time before rejump
        const TIME_LAND      = 16;
        /// pm_time is non-moving time
        const TIME_TELEPORT  = 32;
        /// temporarily disables prediction (used for grappling hook)
        const NO_PREDICTION  = 64;
    }
}

impl PmFlags {
    pub const TIME_MASK: PmFlags = PmFlags::TIME_WATERJUMP
        .union(PmFlags::TIME_LAND)
        .union(PmFlags::TIME_TELEPORT);
}

/// Kinematic state exchanged bit-accurately between server and client.
/// Origin and velocity are 12.3 fixed point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmoveState {
    pub pm_type: PmType,
    pub origin: [i16; 3],
    pub velocity: [i16; 3],
    pub pm_flags: PmFlags,
    /// each unit = 8 ms
    pub pm_time: u8,
    pub gravity: i16,
    /// added to command angles to get view direction
    pub delta_angles: [i16; 3],
}

impl PmoveState {
    pub fn origin_f(&self) -> Vec3 {
        [
            self.origin[0] as f32 * 0.125,
            self.origin[1] as f32 * 0.125,
            self.origin[2] as f32 * 0.125,
        ]
    }

    pub fn velocity_f(&self) -> Vec3 {
        [
            self.velocity[0] as f32 * 0.125,
            self.velocity[1] as f32 * 0.125,
            self.velocity[2] as f32 * 0.125,
        ]
    }
}

/// One client input command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCmd {
    pub msec: u8,
    pub buttons: u8,
    pub angles: [i16; 3],
    pub forwardmove: i16,
    pub sidemove: i16,
    pub upmove: i16,
    pub impulse: u8,
    pub lightlevel: u8,
}

pub const MAXTOUCH: usize = 32;

/// In/out record of one movement step. The trace and point-contents
/// callbacks are supplied separately through `pmove::PmoveCallbacks`.
#[derive(Debug, Clone, PartialEq)]
pub struct PmoveData {
    // state (in / out)
    pub s: PmoveState,

    // command (in)
    pub cmd: UserCmd,
    /// if s has been changed outside pmove
    pub snapinitial: bool,

    // results (out)
    pub numtouch: usize,
    pub touchents: [usize; MAXTOUCH],

    pub viewangles: Vec3,
    pub viewheight: f32,

    pub mins: Vec3,
    pub maxs: Vec3,

    pub groundentity: Option<usize>,
    pub watertype: i32,
    pub waterlevel: i32,
}

impl Default for PmoveData {
    fn default() -> Self {
        Self {
            s: PmoveState::default(),
            cmd: UserCmd::default(),
            snapinitial: false,
            numtouch: 0,
            touchents: [0; MAXTOUCH],
            viewangles: [0.0; 3],
            viewheight: 0.0,
            mins: [0.0; 3],
            maxs: [0.0; 3],
            groundentity: None,
            watertype: 0,
            waterlevel: 0,
        }
    }
}

impl PmoveData {
    pub fn touched(&self) -> &[usize] {
        &self.touchents[..self.numtouch]
    }

    pub(crate) fn add_touch(&mut self, ent: Option<usize>) {
        if let Some(ent) = ent {
            if self.numtouch < MAXTOUCH {
                self.touchents[self.numtouch] = ent;
                self.numtouch += 1;
            }
        }
    }
}

// ============================================================
// Angle/short conversion
// ============================================================

#[inline]
pub fn angle2short(x: f32) -> i32 {
    ((x * 65536.0 / 360.0) as i32) & 65535
}

#[inline]
pub fn short2angle(x: i16) -> f32 {
    (x as f32) * (360.0 / 65536.0)
}

// ============================================================
// Vector math
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn vector_length(v: &Vec3) -> f32 {
    dot_product(v, v).sqrt()
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

#[inline]
pub fn is_zero(v: &Vec3) -> bool {
    v[0] == 0.0 && v[1] == 0.0 && v[2] == 0.0
}

/// Forward, right and up vectors for a pitch/yaw/roll triple in degrees.
pub fn angle_vectors(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let (sy, cy) = angles[YAW].to_radians().sin_cos();
    let (sp, cp) = angles[PITCH].to_radians().sin_cos();
    let (sr, cr) = angles[ROLL].to_radians().sin_cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + -cr * -sy,
        -sr * sp * sy + -cr * cy,
        -sr * cp,
    ];
    let up = [
        cr * sp * cy + -sr * -sy,
        cr * sp * sy + -sr * cy,
        cr * cp,
    ];
    (forward, right, up)
}

/// Rotates `v` into the frame described by the three basis vectors.
/// The right axis is negated so the result is a left-handed y.
#[inline]
pub fn rotate_into_frame(v: &Vec3, forward: &Vec3, right: &Vec3, up: &Vec3) -> Vec3 {
    [
        dot_product(v, forward),
        -dot_product(v, right),
        dot_product(v, up),
    ]
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if p.plane_type < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // pick the nearest and farthest corners from the sign bits
    let mut dist1 = 0.0;
    let mut dist2 = 0.0;
    for j in 0..3 {
        if p.signbits & (1 << j) != 0 {
            dist1 += p.normal[j] * emins[j];
            dist2 += p.normal[j] * emaxs[j];
        } else {
            dist1 += p.normal[j] * emaxs[j];
            dist2 += p.normal[j] * emins[j];
        }
    }

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_and_cross() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
        assert_eq!(cross_product(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_vector_normalize() {
        let mut v = [3.0, 0.0, 4.0];
        let len = vector_normalize(&mut v);
        assert!((len - 5.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[2] - 0.8).abs() < 1e-6);

        let mut zero = [0.0; 3];
        assert_eq!(vector_normalize(&mut zero), 0.0);
        assert_eq!(zero, [0.0; 3]);
    }

    #[test]
    fn test_angle_vectors_identity() {
        let (f, r, u) = angle_vectors(&[0.0, 0.0, 0.0]);
        assert!((f[0] - 1.0).abs() < 1e-6);
        assert!((r[1] + 1.0).abs() < 1e-6);
        assert!((u[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_angle_vectors_yaw_90() {
        let (f, _, _) = angle_vectors(&[0.0, 90.0, 0.0]);
        assert!(f[0].abs() < 1e-6);
        assert!((f[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_short_angle_conversion() {
        assert_eq!(angle2short(90.0), 16384);
        assert!((short2angle(16384) - 90.0).abs() < 1e-4);
        assert!((short2angle(-16384) + 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_signbits() {
        assert_eq!(signbits_for_normal(&[1.0, 0.0, 0.0]), 0);
        assert_eq!(signbits_for_normal(&[-1.0, 0.0, 0.0]), 1);
        assert_eq!(signbits_for_normal(&[0.0, -0.5, -0.5]), 6);
    }

    #[test]
    fn test_box_on_plane_side_axial() {
        let p = CPlane::new([1.0, 0.0, 0.0], 10.0, PLANE_X);
        assert_eq!(box_on_plane_side(&[20.0, 0.0, 0.0], &[30.0, 1.0, 1.0], &p), 1);
        assert_eq!(box_on_plane_side(&[-5.0, 0.0, 0.0], &[5.0, 1.0, 1.0], &p), 2);
        assert_eq!(box_on_plane_side(&[5.0, 0.0, 0.0], &[15.0, 1.0, 1.0], &p), 3);
    }

    #[test]
    fn test_box_on_plane_side_general() {
        let n = 1.0 / 2.0f32.sqrt();
        let p = CPlane::new([n, -n, 0.0], 0.0, PLANE_NON_AXIAL);
        // box entirely on +x, -y side
        assert_eq!(box_on_plane_side(&[10.0, -20.0, 0.0], &[20.0, -10.0, 1.0], &p), 1);
        // box entirely on -x, +y side
        assert_eq!(box_on_plane_side(&[-20.0, 10.0, 0.0], &[-10.0, 20.0, 1.0], &p), 2);
        // straddling the origin
        assert_eq!(box_on_plane_side(&[-1.0, -1.0, 0.0], &[1.0, 1.0, 1.0], &p), 3);
    }

    #[test]
    fn test_plane_distance_axial_matches_dot() {
        let p = CPlane::new([0.0, 0.0, 1.0], 8.0, PLANE_Z);
        let q = CPlane::new([0.0, 0.0, 1.0], 8.0, PLANE_NON_AXIAL);
        let pt = [3.0, -2.0, 20.0];
        assert_eq!(p.distance_to(&pt), q.distance_to(&pt));
    }

    #[test]
    fn test_pmflags_time_mask() {
        let mut f = PmFlags::ON_GROUND | PmFlags::TIME_LAND | PmFlags::TIME_TELEPORT;
        f.remove(PmFlags::TIME_MASK);
        assert_eq!(f, PmFlags::ON_GROUND);
    }

    #[test]
    fn test_trace_default() {
        let trace = Trace::default();
        assert!(!trace.allsolid);
        assert!(!trace.startsolid);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.ent, None);
    }
}
