use rsgc_mark::{
    env::{read_string_from_env, read_uint_from_env},
    GcResult, Heap, HeapArguments, Mutator, ObjectKind, ObjectRef,
};

fn bottom_up_tree(mutator: &Mutator<'_>, depth: usize) -> GcResult<ObjectRef> {
    let node = mutator.allocate(ObjectKind::Regular, 2)?;
    if depth > 0 {
        let left = bottom_up_tree(mutator, depth - 1)?;
        mutator.store(node, 0, Some(left))?;
        let right = bottom_up_tree(mutator, depth - 1)?;
        mutator.store(node, 1, Some(right))?;
    }
    Ok(node)
}

fn main() -> GcResult<()> {
    env_logger::init();

    let depth = read_uint_from_env("DEPTH").unwrap_or(16);
    let args = HeapArguments {
        max_objects: 1 << (depth + 2),
        ..HeapArguments::from_env()?
    };
    let heap = Heap::new(args)?;
    let mutator = heap.attach_thread();

    let long_lived = bottom_up_tree(&mutator, depth)?;
    mutator.add_root(long_lived)?;
    // Unrooted: dead as soon as it is built.
    bottom_up_tree(&mutator, depth.saturating_sub(1))?;

    match read_string_from_env("GC").as_deref() {
        Some("full") => heap.request_full_gc(),
        _ => {
            heap.request_gc();
        }
    }

    println!(
        "depth {}: {} of {} object(s) live",
        depth,
        heap.marking_context().marked_count(),
        heap.arena().top()
    );
    Ok(())
}
