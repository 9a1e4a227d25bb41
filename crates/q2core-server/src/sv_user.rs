// sv_user.rs -- running client movement commands against the world
//
// Feeds queued user commands through pmove with move clipping as its
// collision callbacks, then writes the results back onto the client's edict.

use std::cell::Cell;

use crate::cmd_queue::MoveCommandQueue;
use crate::edict::{client_edict, Edict};
use crate::sv_world::{CollisionModel, SvError, SvWorldContext};
use q2core_common::pmove::{pmove, PmoveCallbacks, PmoveParams};
use q2core_common::q_shared::*;

/// Content mask a player of the given movement type collides with.
pub fn mask_for_pm_type(pm_type: PmType) -> i32 {
    if matches!(pm_type, PmType::Dead | PmType::Gib) {
        MASK_DEADSOLID
    } else {
        MASK_PLAYERSOLID
    }
}

/// Pmove collision callbacks for one client, backed by the area tree.
///
/// Errors from move clipping cannot be returned through the callback
/// interface, so the first one is kept and the failing trace reports the
/// mover as stuck in place. Check `take_error` once pmove returns.
pub struct ServerPmoveCallbacks<'a> {
    world: &'a SvWorldContext,
    edicts: &'a [Edict],
    models: &'a [Option<CModel>],
    cm: &'a dyn CollisionModel,
    passent: usize,
    mask: i32,
    error: Cell<Option<SvError>>,
}

impl<'a> ServerPmoveCallbacks<'a> {
    pub fn new(
        world: &'a SvWorldContext,
        edicts: &'a [Edict],
        models: &'a [Option<CModel>],
        cm: &'a dyn CollisionModel,
        passent: usize,
        pm_type: PmType,
    ) -> Self {
        Self {
            world,
            edicts,
            models,
            cm,
            passent,
            mask: mask_for_pm_type(pm_type),
            error: Cell::new(None),
        }
    }

    pub fn mask(&self) -> i32 {
        self.mask
    }

    fn record(&self, err: SvError) {
        let first = self.error.take().unwrap_or(err);
        self.error.set(Some(first));
    }

    pub fn take_error(&self) -> Option<SvError> {
        self.error.take()
    }
}

impl PmoveCallbacks for ServerPmoveCallbacks<'_> {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace {
        match self.world.trace(
            start,
            mins,
            maxs,
            end,
            Some(self.passent),
            self.mask,
            self.edicts,
            self.models,
            self.cm,
        ) {
            Ok(trace) => trace,
            Err(e) => {
                self.record(e);
                Trace {
                    allsolid: true,
                    startsolid: true,
                    fraction: 0.0,
                    endpos: *start,
                    ..Trace::default()
                }
            }
        }
    }

    fn pointcontents(&self, point: &Vec3) -> i32 {
        match self
            .world
            .point_contents(point, self.edicts, self.models, self.cm)
        {
            Ok(contents) => contents,
            Err(e) => {
                self.record(e);
                0
            }
        }
    }
}

/// Runs one movement command for the client on edict `idx` and relinks it.
/// Returns every entity pmove touched, each once, in first-touch order.
pub fn client_think(
    world: &mut SvWorldContext,
    edicts: &mut [Edict],
    idx: usize,
    cmd: &UserCmd,
    models: &[Option<CModel>],
    cm: &dyn CollisionModel,
    params: &PmoveParams,
) -> Result<Vec<usize>, SvError> {
    let ent = edicts
        .get(idx)
        .filter(|e| e.inuse)
        .ok_or(SvError::BadEdict(idx))?;
    let client = ent.client.as_ref().ok_or(SvError::NotAClient(idx))?;

    // set up for pmove; the edict is authoritative for position
    let mut pm = PmoveData {
        s: client.ps,
        cmd: *cmd,
        mins: ent.mins,
        maxs: ent.maxs,
        ..PmoveData::default()
    };
    for i in 0..3 {
        pm.s.origin[i] = (ent.s.origin[i] * 8.0) as i16;
        pm.s.velocity[i] = (ent.velocity[i] * 8.0) as i16;
    }
    if pm.s != client.old_pmove {
        pm.snapinitial = true;
    }

    {
        let callbacks =
            ServerPmoveCallbacks::new(world, edicts, models, cm, idx, pm.s.pm_type);
        pmove(&mut pm, params, &callbacks);
        if let Some(e) = callbacks.take_error() {
            return Err(e);
        }
    }

    // save results of pmove
    let ent = &mut edicts[idx];
    ent.s.origin = pm.s.origin_f();
    ent.velocity = pm.s.velocity_f();
    ent.mins = pm.mins;
    ent.maxs = pm.maxs;
    ent.viewheight = pm.viewheight;
    ent.waterlevel = pm.waterlevel;
    ent.watertype = pm.watertype;
    ent.groundentity = pm.groundentity;

    if let Some(client) = ent.client.as_mut() {
        client.ps = pm.s;
        client.old_pmove = pm.s;
        client.viewangles = pm.viewangles;

        client.oldbuttons = client.buttons;
        client.buttons = cmd.buttons;
        client.latched_buttons |= client.buttons & !client.oldbuttons;
    }

    world.link_edict(edicts, idx, cm)?;

    let mut touched = Vec::with_capacity(pm.numtouch);
    for &other in pm.touched() {
        if !touched.contains(&other) {
            touched.push(other);
        }
    }
    Ok(touched)
}

/// Drains `queue` and runs each command in arrival order. Commands for
/// empty or non-client slots are dropped; any other error stops the tick and
/// discards the rest of the batch.
///
/// Returns `(edict, touched)` per command that ran.
pub fn run_queued_moves(
    queue: &MoveCommandQueue,
    world: &mut SvWorldContext,
    edicts: &mut [Edict],
    models: &[Option<CModel>],
    cm: &dyn CollisionModel,
    params: &PmoveParams,
) -> Result<Vec<(usize, Vec<usize>)>, SvError> {
    let moves = queue.drain();
    let mut results = Vec::with_capacity(moves.len());

    for mv in moves {
        let idx = client_edict(mv.client);
        match client_think(world, edicts, idx, &mv.cmd, models, cm, params) {
            Ok(touched) => results.push((idx, touched)),
            Err(e @ (SvError::BadEdict(_) | SvError::NotAClient(_))) => {
                log::debug!("dropping command for client {}: {}", mv.client, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_queue::QueuedMove;
    use crate::edict::{EdictPool, GClient, Solid};
    use q2core_common::cmodel::CModelContext;
    use q2core_common::fixtures;

    const PLAYER_MINS: Vec3 = [-16.0, -16.0, -24.0];
    const PLAYER_MAXS: Vec3 = [16.0, 16.0, 32.0];
    /// resting height on top of the cube, 705 in network units
    const ON_CUBE_Z: f32 = 88.125;

    struct Level {
        cm: CModelContext,
        world: SvWorldContext,
        models: Vec<Option<CModel>>,
        pool: EdictPool,
    }

    fn level() -> Level {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut cm = CModelContext::new();
        let mut world = SvWorldContext::new();
        world
            .load_level(&mut cm, "maps/test.bsp", Some(&fixtures::box_room_bsp()))
            .unwrap();
        Level {
            models: SvWorldContext::model_table(&cm).unwrap(),
            cm,
            world,
            pool: EdictPool::new(16),
        }
    }

    impl Level {
        fn spawn_player(&mut self, origin: Vec3) -> usize {
            let idx = self.pool.spawn().unwrap();
            let ent = self.pool.edict_mut(idx).unwrap();
            ent.s.origin = origin;
            ent.mins = PLAYER_MINS;
            ent.maxs = PLAYER_MAXS;
            ent.solid = Solid::Bbox;
            ent.client = Some(GClient {
                ps: PmoveState {
                    gravity: 800,
                    ..PmoveState::default()
                },
                ..GClient::default()
            });
            self.world.link_edict(self.pool.as_mut_slice(), idx, &self.cm).unwrap();
            idx
        }

        fn spawn_box(&mut self, origin: Vec3, mins: Vec3, maxs: Vec3) -> usize {
            let idx = self.pool.spawn().unwrap();
            let ent = self.pool.edict_mut(idx).unwrap();
            ent.s.origin = origin;
            ent.mins = mins;
            ent.maxs = maxs;
            ent.solid = Solid::Bbox;
            self.world.link_edict(self.pool.as_mut_slice(), idx, &self.cm).unwrap();
            idx
        }

        fn think(&mut self, idx: usize, cmd: &UserCmd) -> Result<Vec<usize>, SvError> {
            client_think(
                &mut self.world,
                self.pool.as_mut_slice(),
                idx,
                cmd,
                &self.models,
                &self.cm,
                &PmoveParams::default(),
            )
        }

        fn edict(&self, idx: usize) -> &Edict {
            self.pool.edict(idx).unwrap()
        }
    }

    fn idle() -> UserCmd {
        UserCmd {
            msec: 50,
            ..UserCmd::default()
        }
    }

    fn forward() -> UserCmd {
        UserCmd {
            msec: 50,
            forwardmove: 400,
            ..UserCmd::default()
        }
    }

    #[test]
    fn test_mask_for_pm_type() {
        assert_eq!(mask_for_pm_type(PmType::Normal), MASK_PLAYERSOLID);
        assert_eq!(mask_for_pm_type(PmType::Spectator), MASK_PLAYERSOLID);
        assert_eq!(mask_for_pm_type(PmType::Dead), MASK_DEADSOLID);
        assert_eq!(mask_for_pm_type(PmType::Gib), MASK_DEADSOLID);
    }

    #[test]
    fn test_player_rests_on_cube() {
        let mut lvl = level();
        let player = lvl.spawn_player([0.0, 0.0, ON_CUBE_Z]);

        let touched = lvl.think(player, &idle()).unwrap();
        assert!(touched.is_empty());

        let ent = lvl.edict(player);
        assert_eq!(ent.s.origin, [0.0, 0.0, ON_CUBE_Z]);
        assert_eq!(ent.groundentity, Some(0));
        assert_eq!(ent.waterlevel, 0);
        assert_eq!(ent.viewheight, 22.0);

        let client = ent.client.as_ref().unwrap();
        assert_eq!(client.ps.origin, [0, 0, 705]);
        assert_eq!(client.old_pmove, client.ps);
        assert_eq!(ent.linkcount, 2);
    }

    #[test]
    fn test_blocked_by_box_entity() {
        let mut lvl = level();
        let player = lvl.spawn_player([0.0, 0.0, ON_CUBE_Z]);
        let crate_box = lvl.spawn_box([40.0, 0.0, 64.0], [-8.0, -8.0, 0.0], [8.0, 8.0, 64.0]);

        let mut all_touched = Vec::new();
        for _ in 0..8 {
            all_touched.extend(lvl.think(player, &forward()).unwrap());
        }
        assert!(all_touched.contains(&crate_box), "{:?}", all_touched);

        let x = lvl.edict(player).s.origin[0];
        assert!(x > 15.0 && x <= 16.0, "x = {}", x);
        assert_eq!(lvl.edict(player).groundentity, Some(0));
    }

    #[test]
    fn test_touch_list_is_deduplicated() {
        let mut lvl = level();
        let player = lvl.spawn_player([0.0, 0.0, ON_CUBE_Z]);
        lvl.spawn_box([40.0, 0.0, 64.0], [-8.0, -8.0, 0.0], [8.0, 8.0, 64.0]);

        for _ in 0..8 {
            let touched = lvl.think(player, &forward()).unwrap();
            let mut unique = touched.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), touched.len());
        }
    }

    #[test]
    fn test_buttons_are_latched() {
        let mut lvl = level();
        let player = lvl.spawn_player([0.0, 0.0, ON_CUBE_Z]);

        let press = UserCmd {
            buttons: 1,
            ..idle()
        };
        lvl.think(player, &press).unwrap();
        lvl.think(player, &idle()).unwrap();

        let client = lvl.edict(player).client.as_ref().unwrap();
        assert_eq!(client.buttons, 0);
        assert_eq!(client.oldbuttons, 1);
        assert_eq!(client.latched_buttons, 1);
    }

    #[test]
    fn test_non_clients_are_rejected() {
        let mut lvl = level();
        let thing = lvl.spawn_box([200.0, 0.0, 0.0], [-8.0; 3], [8.0; 3]);
        assert_eq!(lvl.think(thing, &idle()), Err(SvError::NotAClient(thing)));
        assert_eq!(lvl.think(99, &idle()), Err(SvError::BadEdict(99)));
    }

    #[test]
    fn test_clipping_error_is_returned() {
        let mut lvl = level();
        let player = lvl.spawn_player([0.0, 0.0, ON_CUBE_Z]);
        let door = lvl.spawn_box([20.0, 0.0, 64.0], [-8.0, -8.0, 0.0], [8.0, 8.0, 64.0]);
        {
            let ent = lvl.pool.edict_mut(door).unwrap();
            ent.solid = Solid::Bsp;
            ent.s.modelindex = 7;
        }
        lvl.world.link_edict(lvl.pool.as_mut_slice(), door, &lvl.cm).unwrap();

        let err = lvl.think(player, &forward()).unwrap_err();
        assert_eq!(err, SvError::MissingBspModel { ent: door, modelindex: 7 });
    }

    #[test]
    fn test_run_queued_moves_in_order() {
        let mut lvl = level();
        let first = lvl.spawn_player([0.0, 0.0, ON_CUBE_Z]);
        let second = lvl.spawn_player([200.0, 200.0, -24.0]);
        assert_eq!((first, second), (client_edict(0), client_edict(1)));

        let queue = MoveCommandQueue::new(8);
        let sender = queue.sender();
        assert!(sender.try_send(QueuedMove::new(1, idle())));
        assert!(sender.try_send(QueuedMove::new(5, idle())));
        assert!(sender.try_send(QueuedMove::new(0, idle())));

        let results = run_queued_moves(
            &queue,
            &mut lvl.world,
            lvl.pool.as_mut_slice(),
            &lvl.models,
            &lvl.cm,
            &PmoveParams::default(),
        )
        .unwrap();

        let ran: Vec<usize> = results.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(ran, vec![second, first]);
        assert!(queue.is_empty());
    }
}
