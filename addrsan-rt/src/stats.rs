//! Coarse process-wide counters, bumped from the allocation paths and dumped
//! in every report and (with `atexit=1`) at normal exit. Kept as relaxed
//! atomics; the totals only need to be plausible, never exact.

use core::sync::atomic::{AtomicUsize, Ordering};

use libc_print::std_name::eprintln;

use crate::heap::NUM_SIZE_CLASSES;

#[derive(Debug)]
pub struct AsanStats {
    pub mallocs: AtomicUsize,
    pub malloced: AtomicUsize,
    pub malloced_redzones: AtomicUsize,
    pub frees: AtomicUsize,
    pub freed: AtomicUsize,
    pub real_frees: AtomicUsize,
    pub really_freed: AtomicUsize,
    pub reallocs: AtomicUsize,
    pub realloced: AtomicUsize,
    pub mmaps: AtomicUsize,
    pub mmaped: AtomicUsize,
    pub malloc_large: AtomicUsize,
    pub malloced_by_size: [AtomicUsize; NUM_SIZE_CLASSES],
    pub freed_by_size: [AtomicUsize; NUM_SIZE_CLASSES],
    pub really_freed_by_size: [AtomicUsize; NUM_SIZE_CLASSES],
    pub mmaped_by_size: [AtomicUsize; NUM_SIZE_CLASSES],
}

const ZERO: AtomicUsize = AtomicUsize::new(0);

impl AsanStats {
    pub const fn new() -> AsanStats {
        AsanStats {
            mallocs: ZERO,
            malloced: ZERO,
            malloced_redzones: ZERO,
            frees: ZERO,
            freed: ZERO,
            real_frees: ZERO,
            really_freed: ZERO,
            reallocs: ZERO,
            realloced: ZERO,
            mmaps: ZERO,
            mmaped: ZERO,
            malloc_large: ZERO,
            malloced_by_size: [ZERO; NUM_SIZE_CLASSES],
            freed_by_size: [ZERO; NUM_SIZE_CLASSES],
            really_freed_by_size: [ZERO; NUM_SIZE_CLASSES],
            mmaped_by_size: [ZERO; NUM_SIZE_CLASSES],
        }
    }

    pub fn bump(counter: &AtomicUsize, amount: usize) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn print(&self) {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        eprintln!(
            "Stats: {}M malloced ({}M for red zones) by {} calls",
            get(&self.malloced) >> 20,
            get(&self.malloced_redzones) >> 20,
            get(&self.mallocs)
        );
        eprintln!(
            "Stats: {}M realloced by {} calls",
            get(&self.realloced) >> 20,
            get(&self.reallocs)
        );
        eprintln!("Stats: {}M freed by {} calls", get(&self.freed) >> 20, get(&self.frees));
        eprintln!(
            "Stats: {}M really freed by {} calls",
            get(&self.really_freed) >> 20,
            get(&self.real_frees)
        );
        eprintln!(
            "Stats: {}M ({} pages) mmaped in {} calls",
            get(&self.mmaped) >> 20,
            get(&self.mmaped) / crate::utils::page_size(),
            get(&self.mmaps)
        );
        print_by_size(" mmaps   by size: ", &self.mmaped_by_size);
        print_by_size(" mallocs by size: ", &self.malloced_by_size);
        print_by_size(" frees   by size: ", &self.freed_by_size);
        print_by_size(" rfrees  by size: ", &self.really_freed_by_size);
        eprintln!("Stats: malloc large: {}", get(&self.malloc_large));
    }
}

/// One line per populated size class: `class:MiB-moved-through-it`.
fn print_by_size(name: &str, array: &[AtomicUsize; NUM_SIZE_CLASSES]) {
    libc_print::std_name::eprint!("{}", name);
    for (class, counter) in array.iter().enumerate() {
        let count = counter.load(Ordering::Relaxed);
        if count == 0 {
            continue;
        }
        libc_print::std_name::eprint!("{}:{:03}; ", class, (count << class) >> 20);
    }
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = AsanStats::new();
        AsanStats::bump(&stats.mallocs, 1);
        AsanStats::bump(&stats.mallocs, 2);
        AsanStats::bump(&stats.malloced_by_size[5], 7);
        assert_eq!(stats.mallocs.load(Ordering::Relaxed), 3);
        assert_eq!(stats.malloced_by_size[5].load(Ordering::Relaxed), 7);
    }
}
