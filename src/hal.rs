use crate::vmx::VmxCpu;

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;

/// The interfaces which the underlying kernel must implement.
///
/// Everything the engine needs from its host lives here: page allocation,
/// address translation, CPU topology and pinning, and access to the memory
/// of the process issuing ioctls. The privileged instructions themselves are
/// selected by [`VmmHal::Cpu`].
pub trait VmmHal: Sized + Send + Sync + 'static {
    /// The capability instruction layer used on this host.
    type Cpu: VmxCpu;

    /// Allocates `count` physically contiguous, 4K-aligned frames, preferably
    /// on NUMA node `node`.
    fn alloc_contiguous_frames(count: usize, node: Option<usize>) -> Option<HostPhysAddr>;

    /// Frees frames returned by [`VmmHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize);

    /// Allocates a single frame with no placement preference.
    fn alloc_frame() -> Option<HostPhysAddr> {
        Self::alloc_contiguous_frames(1, None)
    }

    /// Frees a frame returned by [`VmmHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr) {
        Self::dealloc_contiguous_frames(paddr, 1)
    }

    /// Converts a physical address to a virtual address mapped by the kernel.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Number of logical CPUs that may host a VCPU.
    fn cpu_count() -> usize;

    /// NUMA node of `cpu`, if the platform has NUMA.
    fn cpu_to_node(_cpu: usize) -> Option<usize> {
        None
    }

    /// Runs `f` with preemption disabled on the current CPU and passes it the
    /// CPU id. Everything touching a VMCS or per-CPU VMX state runs inside.
    fn run_pinned<R>(f: impl FnOnce(usize) -> R) -> R;

    /// Runs `f` once on every CPU in `0..cpu_count()`, each call pinned to
    /// the CPU whose id it receives. Returns after all calls complete.
    fn on_each_cpu(f: &(dyn Fn(usize) + Sync));

    /// Copies `dst.len()` bytes from user address `src`. Returns `false` if
    /// the user range is not accessible.
    fn copy_from_user(dst: &mut [u8], src: usize) -> bool;

    /// Copies `src` to user address `dst`. Returns `false` if the user range
    /// is not accessible.
    fn copy_to_user(dst: usize, src: &[u8]) -> bool;
}
