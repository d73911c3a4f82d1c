//! Shared fuzzing and testing infrastructure for `striped_arena`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ptr::NonNull};
use striped_arena::{ArenaError, Config, PrivateArena, SharedArena, SpinLock, Stats};

/// The requested size of a test allocation.
//
// Note: a newtype rather than a bare `usize` so that we can give it a default
// mutator that keeps sizes within something an arena can actually satisfy.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        // Past the exact-size classes, so the power-of-two buckets get
        // exercised too.
        Self { max_size: 40_000 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Hop to a granule boundary, where off-by-one bugs live.
        if !c.shrink() {
            c.mutation(|ctx| {
                let granule = striped_arena::size_class::GRANULARITY;
                let bump = ctx.rng().gen_index(3).unwrap();
                size.0 = (size.0 / granule + bump) * granule;
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Free { id: u32 },
    Realloc { id: u32, size: Size },
    DoubleFree { id: u32 },
}

impl Op {
    fn id_mut(&mut self) -> &mut u32 {
        match self {
            Op::Alloc { id, .. }
            | Op::Free { id }
            | Op::Realloc { id, .. }
            | Op::DoubleFree { id } => id,
        }
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::DoubleFree {
                    id: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// Which flavor of arena to run the operations against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaKind {
    /// A coalescing `PrivateArena`.
    Private,
    /// A `SharedArena` with a few optimized size classes.
    Shared,
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                *ops.ops[op_index].id_mut() = new_id;
            }
            Ok(())
        })?;

        // Free an existing allocation, sometimes twice.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_op = if ctx.rng().gen_bool() {
                        Op::Free { id }
                    } else {
                        Op::DoubleFree { id }
                    };
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, free_op);
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// The operations both arena flavors support, so one interpreter drives both.
trait Arena {
    fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, ArenaError>;
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), ArenaError>;
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError>;
    fn stats(&self) -> Option<Stats>;
    fn check_integrity(&mut self) -> Result<(), ArenaError>;
}

impl Arena for PrivateArena<'_> {
    fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, ArenaError> {
        PrivateArena::allocate(self, size)
    }
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), ArenaError> {
        PrivateArena::free(self, Some(ptr))
    }
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError> {
        PrivateArena::reallocate(self, Some(ptr), size)
    }
    fn stats(&self) -> Option<Stats> {
        PrivateArena::stats(self)
    }
    fn check_integrity(&mut self) -> Result<(), ArenaError> {
        PrivateArena::check_integrity(self)
    }
}

impl Arena for SharedArena<'_, SpinLock> {
    fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, ArenaError> {
        SharedArena::allocate(self, size)
    }
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), ArenaError> {
        SharedArena::free(self, Some(ptr))
    }
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>, ArenaError> {
        SharedArena::reallocate(self, Some(ptr), size)
    }
    fn stats(&self) -> Option<Stats> {
        SharedArena::stats(self)
    }
    fn check_integrity(&mut self) -> Result<(), ArenaError> {
        SharedArena::check_integrity(self)
    }
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Drop the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh arena of the given kind
    /// carved out of `arena_size` bytes.
    pub fn run(&self, kind: ArenaKind, arena_size: usize) -> Result<(), String> {
        let mut region = vec![0u8; arena_size];
        let bounds = region_bounds(&region);
        match kind {
            ArenaKind::Private => {
                let config = Config::new().track_call_sites(true);
                let arena = PrivateArena::new(&mut region, config).map_err(|e| e.to_string())?;
                self.run_with_arena(arena, &bounds)
            }
            ArenaKind::Shared => {
                let config = Config::new()
                    .optimize_sizes([16, 64, 256], 4)
                    .use_fast_bucket_counts(true);
                let arena = SharedArena::<SpinLock>::new(&mut region, config)
                    .map_err(|e| e.to_string())?;
                self.run_with_arena(arena, &bounds)
            }
        }
    }

    fn run_with_arena<A>(&self, mut arena: A, bounds: &(usize, usize)) -> Result<(), String>
    where
        A: Arena,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();
        let mut high_water = 0;

        // Fill an allocation with its id's byte pattern.
        let fill = |ptr: NonNull<[u8]>, id: u32| unsafe {
            ptr.cast::<u8>().write_bytes(pattern(id), ptr.len());
        };

        // Assert that the first `len` bytes of an allocation still hold its
        // id's pattern.
        let assert_intact = |ptr: NonNull<[u8]>, len: usize, id: u32| -> Result<(), String> {
            let slice = unsafe { &ptr.as_ref()[..len] };
            ensure!(
                slice.iter().all(|b| *b == pattern(id)),
                "id{id}'s contents were clobbered",
            );
            Ok(())
        };

        // Assert that a fresh payload is well formed and does not overlap any
        // other live allocation.
        let assert_fresh = |live: &LiveMap,
                            ptr: NonNull<[u8]>,
                            size: usize|
         -> Result<(), String> {
            let start = ptr.cast::<u8>().as_ptr() as usize;
            let end = start + ptr.len();
            ensure!(size <= ptr.len(), "allocated {} bytes for a request of {size}", ptr.len());
            ensure!(
                ptr.len() % striped_arena::size_class::GRANULARITY == 0,
                "payload length {} is not granular",
                ptr.len(),
            );
            ensure!(
                start % striped_arena::size_class::GRANULARITY == 0,
                "payload at {start:#x} is not granule aligned",
            );
            ensure!(
                bounds.0 <= start && end <= bounds.1,
                "payload {start:#x}..{end:#x} lies outside the arena",
            );
            for other in live.map.values() {
                let other_start = other.cast::<u8>().as_ptr() as usize;
                let other_end = other_start + other.len();
                ensure!(
                    end <= other_start || other_end <= start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        let expected_failure = |err: &ArenaError| matches!(err, ArenaError::OutOfMemory { .. });

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size: Size(size) } => {
                    if let Some(old) = live.remove(id) {
                        assert_intact(old, old.len(), id)?;
                        unsafe { arena.free(old.cast()) }.map_err(|e| e.to_string())?;
                    }
                    match arena.allocate(size) {
                        Ok(ptr) => {
                            assert_fresh(&live, ptr, size)?;
                            fill(ptr, id);
                            live.insert(id, ptr);
                        }
                        Err(err) => ensure!(expected_failure(&err), "allocate({size}): {err}"),
                    }
                }

                Op::Free { id } => {
                    if let Some(ptr) = live.remove(id) {
                        assert_intact(ptr, ptr.len(), id)?;
                        unsafe { arena.free(ptr.cast()) }.map_err(|e| e.to_string())?;
                    }
                }

                Op::DoubleFree { id } => {
                    if let Some(ptr) = live.remove(id) {
                        unsafe { arena.free(ptr.cast()) }.map_err(|e| e.to_string())?;
                        let before = arena.stats();
                        let again = unsafe { arena.free(ptr.cast()) };
                        ensure!(
                            matches!(again, Err(ArenaError::DoubleFree { .. })),
                            "second free of id{id} was not rejected: {again:?}",
                        );
                        ensure!(
                            arena.stats() == before,
                            "rejected double free still changed the statistics",
                        );
                    }
                }

                Op::Realloc { id, size: Size(size) } => {
                    let Some(old) = live.remove(id) else {
                        continue;
                    };
                    match unsafe { arena.reallocate(old.cast(), size) } {
                        Ok(None) => ensure!(size == 0, "reallocate({size}) returned nothing"),
                        Ok(Some(new)) => {
                            ensure!(size != 0, "reallocate(0) returned an allocation");
                            let kept = old.len().min(new.len());
                            assert_intact(new, kept, id)?;
                            if new.len() <= old.len() {
                                ensure!(
                                    new.cast::<u8>() == old.cast::<u8>(),
                                    "shrinking id{id} from {} to {} moved it",
                                    old.len(),
                                    new.len(),
                                );
                            }
                            assert_fresh(&live, new, size)?;
                            fill(new, id);
                            live.insert(id, new);
                        }
                        Err(err) => {
                            ensure!(expected_failure(&err), "reallocate({size}): {err}");
                            assert_intact(old, old.len(), id)?;
                            live.insert(id, old);
                        }
                    }
                }
            }

            if let Some(stats) = arena.stats() {
                ensure!(
                    stats.used == live.total_bytes,
                    "used is {} but {} bytes are live",
                    stats.used,
                    live.total_bytes,
                );
                ensure!(
                    stats.used <= stats.real_used && stats.real_used <= stats.size,
                    "inconsistent accounting: {stats:?}",
                );
                ensure!(
                    stats.max_real_used >= stats.real_used && stats.max_real_used >= high_water,
                    "high-water mark went backwards: {stats:?}",
                );
                high_water = stats.max_real_used;
            }
            arena
                .check_integrity()
                .map_err(|e| format!("after {op:?}: {e}"))?;
        }

        // Finally, free any remaining live allocations.
        for (id, ptr) in std::mem::take(&mut live.map) {
            assert_intact(ptr, ptr.len(), id)?;
            unsafe { arena.free(ptr.cast()) }.map_err(|e| e.to_string())?;
        }
        if let Some(stats) = arena.stats() {
            ensure!(stats.used == 0, "{} bytes still used after freeing everything", stats.used);
        }
        arena.check_integrity().map_err(|e| e.to_string())?;

        Ok(())
    }
}

fn region_bounds(region: &[u8]) -> (usize, usize) {
    let range = region.as_ptr_range();
    (range.start as usize, range.end as usize)
}

/// Every live allocation is filled with a byte derived from its id, so that
/// one allocation scribbling over another is caught.
fn pattern(id: u32) -> u8 {
    (id % 255) as u8 + 1
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, NonNull<[u8]>>,

    /// The total payload bytes that are currently allocated.
    total_bytes: usize,
}

impl LiveMap {
    fn insert(&mut self, id: u32, ptr: NonNull<[u8]>) {
        self.total_bytes += ptr.len();
        let old = self.map.insert(id, ptr);
        assert!(
            old.is_none(),
            "should remove and free old entries before adding new ones"
        );
    }

    fn remove(&mut self, id: u32) -> Option<NonNull<[u8]>> {
        let ptr = self.map.remove(&id)?;
        self.total_bytes -= ptr.len();
        Some(ptr)
    }
}
