//! [`Allocator`] implementations, so that collections can live in an arena.

use core::{alloc::Layout, ptr::NonNull};

use crate::{
    size_class::GRANULARITY, AllocError, Allocator, Lock, PrivateArena, SharedArena, UsageMonitor,
};

/// Payloads are only ever granule aligned.
#[inline]
fn check_align(layout: Layout) -> Result<(), AllocError> {
    if layout.align() > GRANULARITY {
        log::debug!("refusing {layout:?}: alignment above {GRANULARITY}");
        return Err(AllocError);
    }
    Ok(())
}

macro_rules! impl_allocator {
    ( $arena:ident < $param:ident : $bound:ident > ) => {
        unsafe impl<$param> Allocator for $arena<'_, $param>
        where
            $param: $bound,
        {
            #[inline]
            fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
                check_align(layout)?;
                self.allocate(layout.size()).map_err(|_| AllocError)
            }

            #[inline]
            unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
                if let Err(err) = self.free(Some(ptr)) {
                    panic!("{err}");
                }
            }

            #[inline]
            unsafe fn grow(
                &self,
                ptr: NonNull<u8>,
                _old_layout: Layout,
                new_layout: Layout,
            ) -> Result<NonNull<[u8]>, AllocError> {
                check_align(new_layout)?;
                self.reallocate(Some(ptr), new_layout.size().max(1))
                    .map_err(|_| AllocError)?
                    .ok_or(AllocError)
            }

            #[inline]
            unsafe fn shrink(
                &self,
                ptr: NonNull<u8>,
                _old_layout: Layout,
                new_layout: Layout,
            ) -> Result<NonNull<[u8]>, AllocError> {
                check_align(new_layout)?;
                // A zero size would free the block.
                self.reallocate(Some(ptr), new_layout.size().max(1))
                    .map_err(|_| AllocError)?
                    .ok_or(AllocError)
            }
        }
    };
}

impl_allocator!(PrivateArena<M: UsageMonitor>);
impl_allocator!(SharedArena<L: Lock>);
