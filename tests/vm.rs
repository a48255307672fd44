//! Virtual-memory integration scenarios.

use minos::dev::{Disk, DiskRole, MemDisk};
use minos::fs::FileSys;
use minos::task::Task;
use minos::vm::{Va, Vm, PAGE_BLOCKS, PGSIZE, PHYS_BASE, STACK_MAX};
use minos::KernelError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn vm_with(frames: usize, swap_sectors: usize) -> Arc<Vm> {
    let _ = env_logger::builder().is_test(true).try_init();
    Vm::new(frames, Disk::new(MemDisk::new(swap_sectors), DiskRole::Swap)).unwrap()
}

fn fs_with(sectors: usize) -> FileSys {
    FileSys::format(Disk::new(MemDisk::new(sectors), DiskRole::FileSys), 16).unwrap()
}

const ANON_BASE: usize = 0x1000_0000;
const MAP_BASE: usize = 0x2000_0000;
const SEG_BASE: usize = 0x3000_0000;

#[test]
fn stack_growth_within_heuristic() {
    let vm = vm_with(4, 64);
    let task = Task::new("stack", vm);
    task.set_stack_pointer(PHYS_BASE - 4096);

    // 4 bytes below the stack pointer: within the PUSHA slack.
    let addr = Va(PHYS_BASE - 4100);
    task.page_fault(addr).unwrap();
    assert!(task.is_resident(addr));

    // The fresh stack page reads as zeros.
    let mut buf = [0xffu8; 64];
    task.read_user(addr.page_down(), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn stack_growth_rejections() {
    let vm = vm_with(4, 64);
    let task = Task::new("stack", vm);
    task.set_stack_pointer(PHYS_BASE - 4096);

    // Far below the stack pointer: not growth.
    assert_eq!(
        task.page_fault(Va(PHYS_BASE - 64 * 1024)),
        Err(KernelError::BadAddress)
    );
    // Below the stack region entirely.
    assert_eq!(
        task.page_fault(Va(PHYS_BASE - STACK_MAX - PGSIZE)),
        Err(KernelError::BadAddress)
    );
    // Kernel addresses never fault in.
    assert_eq!(task.page_fault(Va(PHYS_BASE)), Err(KernelError::BadAddress));
}

#[test]
fn swap_round_trip_preserves_contents() {
    let vm = vm_with(2, 256);
    let task = Task::new("swapper", vm.clone());

    // Four distinct anonymous pages through a two-frame pool.
    for i in 0..4usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        task.alloc_page(va, true).unwrap();
        task.write_user(va, &[i as u8 + 1; 512]).unwrap();
    }
    let swapped = (0..4usize)
        .filter(|&i| task.is_swapped(Va(ANON_BASE + i * PGSIZE)))
        .count();
    assert!(swapped >= 2, "pressure must have pushed pages to swap");

    // Faulting them back yields the bytes from eviction time.
    for i in 0..4usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        let mut buf = [0u8; 512];
        task.read_user(va, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == i as u8 + 1), "page {}", i);
    }

    // Teardown returns every swap slot.
    drop(task);
    assert_eq!(vm.free_swap_slots(), 256 / PAGE_BLOCKS);
}

#[test]
fn frame_and_swap_slot_are_mutually_exclusive() {
    let vm = vm_with(2, 256);
    let task = Task::new("excl", vm);
    for i in 0..4usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        task.alloc_page(va, true).unwrap();
        task.write_user(va, &[9; 16]).unwrap();
    }
    for i in 0..4usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        assert!(
            !(task.is_resident(va) && task.is_swapped(va)),
            "page {} both resident and swapped",
            i
        );
    }
}

#[test]
fn mmap_dirty_page_writes_back_on_munmap() {
    let fs = fs_with(1024);
    let vm = vm_with(4, 128);
    let file = fs.create_file("/map.bin", 0).unwrap();
    file.write_at(&vec![0xab; 5000], 0).unwrap();

    let task = Task::new("mapper", vm);
    let base = Va(MAP_BASE);
    assert_eq!(task.mmap(file.clone(), 3, base).unwrap(), 3);

    // Dirty one byte on the second page.
    task.write_user(Va(MAP_BASE + 4096), b"M").unwrap();
    task.munmap(3).unwrap();

    let mut out = vec![0u8; 5000];
    file.read_at(&mut out, 0).unwrap();
    assert_eq!(out[4096], b'M');
    assert!(out[..4096].iter().all(|&b| b == 0xab), "prefix must be untouched");
    assert!(out[4097..].iter().all(|&b| b == 0xab), "suffix must be untouched");

    // The mapping is gone.
    assert!(!task.has_record(base));
    assert_eq!(task.munmap(3), Err(KernelError::InvalidArgument));
}

#[test]
fn mmap_validation() {
    let fs = fs_with(1024);
    let vm = vm_with(4, 64);
    let file = fs.create_file("/v.bin", 0).unwrap();
    file.write_at(&[1; 100], 0).unwrap();
    let empty = fs.create_file("/empty.bin", 0).unwrap();
    let task = Task::new("validator", vm);

    // Null, unaligned, stack-region, zero-length.
    assert!(task.mmap(file.clone(), 1, Va(0)).is_err());
    assert!(task.mmap(file.clone(), 1, Va(MAP_BASE + 13)).is_err());
    assert!(task
        .mmap(file.clone(), 1, Va(PHYS_BASE - STACK_MAX))
        .is_err());
    assert!(task.mmap(empty, 1, Va(MAP_BASE)).is_err());

    // Overlap with an existing record, and duplicate ids.
    task.alloc_page(Va(MAP_BASE), true).unwrap();
    assert!(task.mmap(file.clone(), 1, Va(MAP_BASE)).is_err());

    assert_eq!(task.mmap(file.clone(), 1, Va(MAP_BASE + 0x10000)).unwrap(), 1);
    assert!(task
        .mmap(file.clone(), 1, Va(MAP_BASE + 0x20000))
        .is_err());
}

#[test]
fn mmap_exit_writes_back_like_munmap() {
    let fs = fs_with(1024);
    let vm = vm_with(4, 64);
    let file = fs.create_file("/exit.bin", 0).unwrap();
    file.write_at(&[0u8; 2000], 0).unwrap();
    {
        let task = Task::new("exiter", vm);
        task.mmap(file.clone(), 7, Va(MAP_BASE)).unwrap();
        task.write_user(Va(MAP_BASE + 100), b"exit data").unwrap();
        // Task dropped without munmap.
    }
    let mut out = [0u8; 9];
    file.read_at(&mut out, 100).unwrap();
    assert_eq!(&out, b"exit data");
}

#[test]
fn file_backed_segment_reads_file_and_zero_tail() {
    let fs = fs_with(1024);
    let vm = vm_with(4, 64);
    let file = fs.create_file("/seg.bin", 0).unwrap();
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
    file.write_at(&content, 0).unwrap();

    let task = Task::new("loader", vm);
    // One page: 1000 bytes from the file, the rest zero.
    task.map_segment(file, 0, Va(SEG_BASE), 1000, PGSIZE - 1000, true)
        .unwrap();

    let mut out = vec![0xffu8; PGSIZE];
    task.read_user(Va(SEG_BASE), &mut out).unwrap();
    assert_eq!(&out[..1000], &content[..]);
    assert!(out[1000..].iter().all(|&b| b == 0));
}

#[test]
fn read_only_text_stays_resident_under_pressure() {
    let fs = fs_with(1024);
    let vm = vm_with(2, 256);
    let file = fs.create_file("/text.bin", 0).unwrap();
    file.write_at(&[0xeeu8; PGSIZE], 0).unwrap();

    let task = Task::new("text", vm);
    let text = Va(SEG_BASE);
    task.map_segment(file, 0, text, PGSIZE, 0, false).unwrap();

    // Fault the text page in, then push anonymous pages through the
    // remaining frame.
    let mut buf = [0u8; 4];
    task.read_user(text, &mut buf).unwrap();
    assert_eq!(buf, [0xee; 4]);
    for i in 0..6usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        task.alloc_page(va, true).unwrap();
        task.write_user(va, &[i as u8; 8]).unwrap();
    }

    // The read-only text page was pinned and never evicted.
    assert!(task.is_resident(text));

    // And it is not writable.
    assert_eq!(
        task.write_user(text, b"x"),
        Err(KernelError::BadAddress)
    );
}

#[test]
fn dirty_file_page_goes_to_swap_not_to_the_file() {
    let fs = fs_with(1024);
    let vm = vm_with(2, 256);
    let file = fs.create_file("/data.bin", 0).unwrap();
    file.write_at(&[0x11u8; PGSIZE], 0).unwrap();

    let task = Task::new("data", vm);
    let seg = Va(SEG_BASE);
    task.map_segment(file.clone(), 0, seg, PGSIZE, 0, true).unwrap();
    task.write_user(seg, &[0x77u8; 32]).unwrap();

    // Evict it by pressuring the two-frame pool.
    for i in 0..4usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        task.alloc_page(va, true).unwrap();
        task.write_user(va, &[1; 8]).unwrap();
    }
    assert!(task.is_swapped(seg), "dirty data page must be swapped out");

    // The modified bytes come back from swap.
    let mut buf = [0u8; 32];
    task.read_user(seg, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x77));

    // The underlying file is untouched: non-mmap pages never write back.
    let mut out = [0u8; 32];
    file.read_at(&mut out, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0x11));
}

#[test]
fn clean_file_page_is_refilled_from_the_file() {
    let fs = fs_with(1024);
    let vm = vm_with(2, 256);
    let file = fs.create_file("/ro.bin", 0).unwrap();
    file.write_at(&[0x44u8; PGSIZE], 0).unwrap();

    let task = Task::new("clean", vm);
    let seg = Va(SEG_BASE);
    task.map_segment(file, 0, seg, PGSIZE, 0, true).unwrap();

    let mut buf = [0u8; 8];
    task.read_user(seg, &mut buf).unwrap();
    assert_eq!(buf, [0x44; 8]);

    for i in 0..4usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        task.alloc_page(va, true).unwrap();
        task.write_user(va, &[1; 8]).unwrap();
    }
    // Clean page: dropped without a swap write.
    assert!(!task.is_swapped(seg));

    task.read_user(seg, &mut buf).unwrap();
    assert_eq!(buf, [0x44; 8]);
}

#[test]
fn pinned_pages_survive_pressure() {
    let vm = vm_with(2, 256);
    let task = Task::new("pinner", vm);
    let hot = Va(ANON_BASE);
    task.alloc_page(hot, true).unwrap();
    task.write_user(hot, &[0x99; 16]).unwrap();
    task.pin(hot).unwrap();

    for i in 1..6usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        task.alloc_page(va, true).unwrap();
        task.write_user(va, &[i as u8; 16]).unwrap();
    }
    assert!(task.is_resident(hot), "pinned page must not be evicted");
    task.unpin(hot);

    let mut buf = [0u8; 16];
    task.read_user(hot, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x99));
}

#[test]
fn uaccess_rejects_kernel_and_unmapped_addresses() {
    let vm = vm_with(2, 64);
    let task = Task::new("checker", vm);
    let mut buf = [0u8; 8];

    assert_eq!(
        task.read_user(Va(PHYS_BASE), &mut buf),
        Err(KernelError::BadAddress)
    );
    // A range straddling the boundary fails too.
    assert_eq!(
        task.read_user(Va(PHYS_BASE - 4), &mut buf),
        Err(KernelError::BadAddress)
    );
    // Unmapped, not stack growth.
    assert_eq!(
        task.read_user(Va(0x500), &mut buf),
        Err(KernelError::BadAddress)
    );
}

#[test]
fn second_chance_prefers_unreferenced_pages() {
    let vm = vm_with(2, 256);
    let task = Task::new("clock", vm);
    let a = Va(ANON_BASE);
    let b = Va(ANON_BASE + PGSIZE);
    let c = Va(ANON_BASE + 2 * PGSIZE);
    for va in [a, b, c] {
        task.alloc_page(va, true).unwrap();
    }

    // A and B resident, both accessed.
    task.write_user(a, &[1; 4]).unwrap();
    task.write_user(b, &[2; 4]).unwrap();
    assert!(task.is_resident(a) && task.is_resident(b));

    // Faulting C in evicts exactly one of them.
    task.write_user(c, &[3; 4]).unwrap();
    let resident: Vec<bool> = [a, b, c].iter().map(|&v| task.is_resident(v)).collect();
    assert!(resident[2], "just-faulted page must be resident");
    assert_eq!(
        resident.iter().filter(|&&r| r).count(),
        2,
        "residency must match the frame pool size"
    );

    // Contents stay intact regardless of who was chosen.
    let mut buf = [0u8; 4];
    task.read_user(a, &mut buf).unwrap();
    assert_eq!(buf, [1; 4]);
    task.read_user(b, &mut buf).unwrap();
    assert_eq!(buf, [2; 4]);
    task.read_user(c, &mut buf).unwrap();
    assert_eq!(buf, [3; 4]);
}

#[test]
fn working_set_isolation_falls_back_globally() {
    // One task fills the pool; a second task with no frames of its own
    // must still be able to allocate by evicting globally.
    let vm = vm_with(2, 256);
    let first = Task::new("hog", vm.clone());
    for i in 0..2usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        first.alloc_page(va, true).unwrap();
        first.write_user(va, &[7; 8]).unwrap();
    }

    let second = Task::new("newcomer", vm);
    second.alloc_page(Va(ANON_BASE), true).unwrap();
    second.write_user(Va(ANON_BASE), &[8; 8]).unwrap();
    assert!(second.is_resident(Va(ANON_BASE)));

    // The hog's pages are still readable (one came back from swap).
    for i in 0..2usize {
        let va = Va(ANON_BASE + i * PGSIZE);
        let mut buf = [0u8; 8];
        first.read_user(va, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }
}

#[test]
fn pinned_copies_survive_concurrent_cross_task_eviction() {
    // One holder repeatedly copies through a pinned page while a second
    // task thrashes the two-frame pool from another thread. Every copy
    // must see the holder's own bytes: a pin that loses to an eviction
    // claim must be retried, never silently defeated.
    let vm = vm_with(2, 1024);
    let holder = Task::new("holder", vm.clone());
    let hot = Va(ANON_BASE);
    holder.alloc_page(hot, true).unwrap();
    holder.write_user(hot, &[0x5a; PGSIZE]).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let thrasher = {
        let vm = vm.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let task = Task::new("thrasher", vm);
            let mut i = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let va = Va(ANON_BASE + ((i % 8) + 1) * PGSIZE);
                task.alloc_page(va, true).unwrap();
                let pat = i as u8;
                task.write_user(va, &[pat; 64]).unwrap();
                let mut check = [0u8; 64];
                task.read_user(va, &mut check).unwrap();
                assert_eq!(check, [pat; 64], "thrasher page {} corrupted", i % 8);
                i += 1;
            }
        })
    };

    let mut buf = [0u8; PGSIZE];
    for round in 0..200 {
        holder.write_user(hot, &[0x5a; PGSIZE]).unwrap();
        holder.read_user(hot, &mut buf).unwrap();
        assert!(
            buf.iter().all(|&b| b == 0x5a),
            "round {}: pinned copy observed foreign bytes",
            round
        );
    }
    stop.store(true, Ordering::SeqCst);
    thrasher.join().unwrap();
}

#[test]
fn shared_vm_across_tasks_keeps_pages_separate() {
    let vm = vm_with(4, 256);
    let a = Task::new("a", vm.clone());
    let b = Task::new("b", vm);
    let va = Va(ANON_BASE);
    a.alloc_page(va, true).unwrap();
    b.alloc_page(va, true).unwrap();
    a.write_user(va, &[0xaa; 32]).unwrap();
    b.write_user(va, &[0xbb; 32]).unwrap();

    let mut buf = [0u8; 32];
    a.read_user(va, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0xaa));
    b.read_user(va, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0xbb));
}
