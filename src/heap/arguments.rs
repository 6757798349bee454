use std::fmt;

use crate::{
    env::{env_lookup, read_bool_with, read_uint_with},
    error::{GcError, GcResult},
    utils::task_terminator::WorkStealingArguments,
};

/// Tunables of the heap and its marking machinery.
///
/// Every field can be overridden through an `RSGC_*` variable, see
/// [`HeapArguments::from_env`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HeapArguments {
    pub work_stealing: WorkStealingArguments,
    /// Upper bound of concurrent mark rounds that end with a handshake
    /// flushing mutator SATB buffers.
    pub max_satb_buffer_flushes: usize,
    pub satb_buffer_size: usize,
    /// A full SATB buffer is handed to the markers when more than this
    /// percentage of it survives filtering.
    pub satb_buffer_enqueue_threshold_percent: usize,
    pub parallel_gc_threads: usize,
    pub conc_gc_threads: usize,
    /// Number of tasks a marker processes between SATB drains and
    /// cancellation checks.
    pub mark_loop_stride: usize,
    /// Objects with more reference fields than this are scanned in slices.
    pub obj_array_marking_stride: usize,
    pub max_objects: usize,
    pub string_dedup: bool,
}

impl Default for HeapArguments {
    fn default() -> Self {
        let parallel_gc_threads = num_cpus::get().max(1);
        Self {
            work_stealing: WorkStealingArguments::default(),
            max_satb_buffer_flushes: 5,
            satb_buffer_size: 1024,
            satb_buffer_enqueue_threshold_percent: 60,
            parallel_gc_threads,
            conc_gc_threads: (parallel_gc_threads / 4).max(1),
            mark_loop_stride: 1000,
            obj_array_marking_stride: 2048,
            max_objects: 1024 * 1024,
            string_dedup: false,
        }
    }
}

fn uint_arg(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: usize,
) -> GcResult<usize> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => read_uint_with(|_| Some(value.clone()), name)
            .ok_or_else(|| GcError::InvalidArgument { name, value }),
    }
}

fn bool_arg(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> GcResult<bool> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => read_bool_with(|_| Some(value.clone()), name)
            .ok_or_else(|| GcError::InvalidArgument { name, value }),
    }
}

fn u32_arg(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u32,
) -> GcResult<u32> {
    let value = uint_arg(lookup, name, default as usize)?;
    u32::try_from(value).map_err(|_| GcError::InvalidArgument {
        name,
        value: value.to_string(),
    })
}

fn invalid(name: &'static str, value: impl ToString) -> GcError {
    GcError::InvalidArgument {
        name,
        value: value.to_string(),
    }
}

impl HeapArguments {
    /// Reads the arguments from the process environment.
    pub fn from_env() -> GcResult<Self> {
        Self::from_lookup(env_lookup)
    }

    /// Reads the arguments from an arbitrary key/value source. Keys that are
    /// absent keep their default value; keys that are present but cannot be
    /// parsed are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GcResult<Self> {
        let defaults = Self::default();
        let parallel_gc_threads = uint_arg(
            &lookup,
            "RSGC_PARALLEL_GC_THREADS",
            defaults.parallel_gc_threads,
        )?;

        let args = Self {
            work_stealing: WorkStealingArguments {
                hard_spins: u32_arg(
                    &lookup,
                    "RSGC_WORK_STEALING_HARD_SPINS",
                    defaults.work_stealing.hard_spins,
                )?,
                spin_to_yield_ratio: u32_arg(
                    &lookup,
                    "RSGC_WORK_STEALING_SPIN_TO_YIELD_RATIO",
                    defaults.work_stealing.spin_to_yield_ratio,
                )?,
                yields_before_sleep: u32_arg(
                    &lookup,
                    "RSGC_WORK_STEALING_YIELDS_BEFORE_SLEEP",
                    defaults.work_stealing.yields_before_sleep,
                )?,
                sleep_millis: uint_arg(
                    &lookup,
                    "RSGC_WORK_STEALING_SLEEP_MILLIS",
                    defaults.work_stealing.sleep_millis as usize,
                )? as u64,
            },
            max_satb_buffer_flushes: uint_arg(
                &lookup,
                "RSGC_MAX_SATB_BUFFER_FLUSHES",
                defaults.max_satb_buffer_flushes,
            )?,
            satb_buffer_size: uint_arg(&lookup, "RSGC_SATB_BUFFER_SIZE", defaults.satb_buffer_size)?,
            satb_buffer_enqueue_threshold_percent: uint_arg(
                &lookup,
                "RSGC_SATB_BUFFER_ENQUEUE_THRESHOLD_PERCENT",
                defaults.satb_buffer_enqueue_threshold_percent,
            )?,
            parallel_gc_threads,
            // The concurrent default follows the parallel count when only
            // the latter is overridden.
            conc_gc_threads: uint_arg(
                &lookup,
                "RSGC_CONC_GC_THREADS",
                (parallel_gc_threads / 4).max(1),
            )?,
            mark_loop_stride: uint_arg(&lookup, "RSGC_MARK_LOOP_STRIDE", defaults.mark_loop_stride)?,
            obj_array_marking_stride: uint_arg(
                &lookup,
                "RSGC_OBJ_ARRAY_MARKING_STRIDE",
                defaults.obj_array_marking_stride,
            )?,
            max_objects: uint_arg(&lookup, "RSGC_MAX_OBJECTS", defaults.max_objects)?,
            string_dedup: bool_arg(&lookup, "RSGC_STRING_DEDUP", defaults.string_dedup)?,
        };

        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> GcResult<()> {
        if self.parallel_gc_threads == 0 {
            return Err(invalid("RSGC_PARALLEL_GC_THREADS", self.parallel_gc_threads));
        }
        if self.conc_gc_threads == 0 {
            return Err(invalid("RSGC_CONC_GC_THREADS", self.conc_gc_threads));
        }
        if self.max_satb_buffer_flushes == 0 {
            return Err(invalid(
                "RSGC_MAX_SATB_BUFFER_FLUSHES",
                self.max_satb_buffer_flushes,
            ));
        }
        if self.satb_buffer_size == 0 {
            return Err(invalid("RSGC_SATB_BUFFER_SIZE", self.satb_buffer_size));
        }
        if self.satb_buffer_enqueue_threshold_percent > 100 {
            return Err(invalid(
                "RSGC_SATB_BUFFER_ENQUEUE_THRESHOLD_PERCENT",
                self.satb_buffer_enqueue_threshold_percent,
            ));
        }
        if self.mark_loop_stride == 0 {
            return Err(invalid("RSGC_MARK_LOOP_STRIDE", self.mark_loop_stride));
        }
        if self.obj_array_marking_stride == 0 {
            return Err(invalid(
                "RSGC_OBJ_ARRAY_MARKING_STRIDE",
                self.obj_array_marking_stride,
            ));
        }
        if self.max_objects == 0 {
            return Err(invalid("RSGC_MAX_OBJECTS", self.max_objects));
        }
        if self.work_stealing.spin_to_yield_ratio >= u32::BITS {
            return Err(invalid(
                "RSGC_WORK_STEALING_SPIN_TO_YIELD_RATIO",
                self.work_stealing.spin_to_yield_ratio,
            ));
        }
        Ok(())
    }

    /// Number of task queues the heap needs: one per worker of the larger
    /// of the two pools.
    pub fn max_workers(&self) -> usize {
        self.parallel_gc_threads.max(self.conc_gc_threads)
    }
}

impl fmt::Debug for HeapArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapArguments")
            .field("hard_spins", &self.work_stealing.hard_spins)
            .field("spin_to_yield_ratio", &self.work_stealing.spin_to_yield_ratio)
            .field("yields_before_sleep", &self.work_stealing.yields_before_sleep)
            .field("sleep_millis", &self.work_stealing.sleep_millis)
            .field("max_satb_buffer_flushes", &self.max_satb_buffer_flushes)
            .field("satb_buffer_size", &self.satb_buffer_size)
            .field(
                "satb_buffer_enqueue_threshold_percent",
                &self.satb_buffer_enqueue_threshold_percent,
            )
            .field("parallel_gc_threads", &self.parallel_gc_threads)
            .field("conc_gc_threads", &self.conc_gc_threads)
            .field("mark_loop_stride", &self.mark_loop_stride)
            .field("obj_array_marking_stride", &self.obj_array_marking_stride)
            .field("max_objects", &self.max_objects)
            .field("string_dedup", &self.string_dedup)
            .finish()
    }
}
