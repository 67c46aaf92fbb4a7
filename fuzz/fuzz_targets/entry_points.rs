#![no_main]

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate memory of the given size
    Alloc { size: u16 },
    /// Allocate with an alignment of 1 << (align_bit % 16)
    AlignedAlloc { size: u16, align_bit: u8 },
    /// Release the ith live allocation
    Release { index: u8 },
    /// Reallocate the ith live allocation
    Realloc { index: u8, new_size: u16 },
    /// Return free memory to the OS
    Trim { pad: u16 },
}
use Actions::*;

fuzz_target!(|actions: Vec<Actions>| {
    let mut allocations: Vec<(*mut u8, usize, u8)> = vec![];

    for (round, action) in actions.into_iter().enumerate() {
        let stamp = (round % 255) as u8 + 1;

        match action {
            Alloc { size } => {
                let size = size as usize;
                let ptr = unsafe { marl::allocate(size) };

                if !ptr.is_null() {
                    assert!(unsafe { marl::usable_size(ptr) } >= size);
                    unsafe { ptr.write_bytes(stamp, size) };
                    allocations.push((ptr, size, stamp));
                }
            }
            AlignedAlloc { size, align_bit } => {
                let size = size as usize;
                let align = 1usize << (align_bit % 16);
                let ptr = unsafe { marl::aligned_allocate(align, size) };

                if !ptr.is_null() {
                    assert_eq!(ptr as usize % align, 0);
                    unsafe { ptr.write_bytes(stamp, size) };
                    allocations.push((ptr, size, stamp));
                }
            }
            Release { index } => {
                if index as usize >= allocations.len() {
                    continue;
                }

                let (ptr, size, stamp) = allocations.swap_remove(index as usize);
                for offset in (0..size).step_by(53) {
                    assert_eq!(unsafe { *ptr.add(offset) }, stamp);
                }
                unsafe { marl::release(ptr) };
            }
            Realloc { index, new_size } => {
                if index as usize >= allocations.len() || new_size == 0 {
                    continue;
                }

                let (ptr, size, old_stamp) = allocations[index as usize];
                let new_size = new_size as usize;
                let ptr = unsafe { marl::reallocate(ptr, new_size) };

                if !ptr.is_null() {
                    for offset in (0..size.min(new_size)).step_by(53) {
                        assert_eq!(unsafe { *ptr.add(offset) }, old_stamp);
                    }
                    unsafe { ptr.write_bytes(stamp, new_size) };
                    allocations[index as usize] = (ptr, new_size, stamp);
                }
            }
            Trim { pad } => {
                marl::trim(pad as usize);
            }
        }
    }

    // Free any remaining allocations.
    for (ptr, size, stamp) in allocations {
        for offset in (0..size).step_by(53) {
            assert_eq!(unsafe { *ptr.add(offset) }, stamp);
        }
        unsafe { marl::release(ptr) };
    }
});
