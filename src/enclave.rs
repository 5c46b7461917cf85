//! Enclave table and life cycle
//!
//! The [SecurityMonitor] owns a fixed-capacity slab of enclave slots behind a single global lock.
//! All state-machine transitions happen under that lock, while expensive work (memory zeroing,
//! signing) runs after the slot has been moved into a state that forbids conflicting operations.
//! The life cycle follows creation → run → stop/resume → destruction, with rollback in reverse
//! order of side effects whenever creation fails.

use castellan_core::abi::stop;
use castellan_core::size::{MDSIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
use castellan_core::{CreateArgs, RuntimeParams};
use spin::{Mutex, MutexGuard, Once};
use zeroize::Zeroize;

use crate::arch::pmp::{PmpManager, PmpPriority, RegionId, Segment, PMP_ALL_PERM, PMP_NO_PERM};
use crate::arch::{satp, Arch, Architecture, HartCtx, TrapRegs};
use crate::config;
use crate::context::{self, ThreadState};
use crate::error::SmError;
use crate::identity::{self, CertDer, SmIdentity};
use crate::platform::{Plat, Platform};
use crate::{measure, mem};

pub type EnclaveId = usize;

// ——————————————————————————————— Enclave Slot ————————————————————————————— //

/// The enclave state machine.
///
/// The ordering is part of the contract: an enclave exists when its state is not `Invalid`, is
/// destroyable while `state <= Stopped`, and is attestable from `Fresh` onwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnclaveState {
    Invalid,
    Destroying,
    Allocated,
    Fresh,
    Stopped,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionType {
    /// Enclave private memory, isolated from the host.
    Epm,
    /// Untrusted memory, shared between host and enclave.
    Utm,
}

/// A memory region held by an enclave, as a handle onto the PMP manager's descriptor.
#[derive(Clone, Copy, Debug)]
pub struct EnclaveRegion {
    pub kind: RegionType,
    pub pmp_rid: RegionId,
}

/// One enclave slot.
pub struct Enclave {
    pub(crate) state: EnclaveState,
    pub(crate) eid: EnclaveId,
    pub(crate) regions: [Option<EnclaveRegion>; config::ENCLAVE_REGIONS_MAX],
    pub(crate) params: RuntimeParams,
    pub(crate) encl_satp: usize,
    pub(crate) n_thread: usize,
    pub(crate) threads: [ThreadState; config::MAX_ENCL_THREADS],
    /// Measurement digest, fixed from `Fresh` onwards.
    pub(crate) hash: [u8; MDSIZE],
    /// Compound device identifier, fixed from `Fresh` onwards.
    pub(crate) cdi: [u8; MDSIZE],
    pub(crate) local_att_pub: [u8; PUBLIC_KEY_SIZE],
    pub(crate) local_att_priv: [u8; PRIVATE_KEY_SIZE],
    pub(crate) crt_local_att: CertDer,
    pub(crate) pk_array: [[u8; PUBLIC_KEY_SIZE]; config::NB_KEYPAIRS_MAX],
    pub(crate) sk_array: [[u8; PRIVATE_KEY_SIZE]; config::NB_KEYPAIRS_MAX],
    pub(crate) n_keypair: usize,
    pub(crate) pk_ldev: [u8; PUBLIC_KEY_SIZE],
    pub(crate) sk_ldev: [u8; PRIVATE_KEY_SIZE],
    pub(crate) crt_ldev: CertDer,
}

impl Enclave {
    fn invalid() -> Self {
        Enclave {
            state: EnclaveState::Invalid,
            eid: 0,
            regions: [None; config::ENCLAVE_REGIONS_MAX],
            params: RuntimeParams::default(),
            encl_satp: 0,
            n_thread: 0,
            threads: [ThreadState::clean(); config::MAX_ENCL_THREADS],
            hash: [0; MDSIZE],
            cdi: [0; MDSIZE],
            local_att_pub: [0; PUBLIC_KEY_SIZE],
            local_att_priv: [0; PRIVATE_KEY_SIZE],
            crt_local_att: CertDer::empty(),
            pk_array: [[0; PUBLIC_KEY_SIZE]; config::NB_KEYPAIRS_MAX],
            sk_array: [[0; PRIVATE_KEY_SIZE]; config::NB_KEYPAIRS_MAX],
            n_keypair: 0,
            pk_ldev: [0; PUBLIC_KEY_SIZE],
            sk_ldev: [0; PRIVATE_KEY_SIZE],
            crt_ldev: CertDer::empty(),
        }
    }

    pub(crate) fn exists(&self) -> bool {
        self.state != EnclaveState::Invalid
    }

    /// Clears the slot, wiping all secret material.
    fn reset(&mut self) {
        self.cdi.zeroize();
        self.local_att_priv.zeroize();
        self.sk_ldev.zeroize();
        for sk in self.sk_array.iter_mut() {
            sk.zeroize();
        }
        *self = Enclave::invalid();
    }
}

// —————————————————————————————— Enclave Table ————————————————————————————— //

pub(crate) struct EnclaveTable {
    pub(crate) slots: [Enclave; config::ENCL_MAX],
}

impl EnclaveTable {
    fn new() -> Self {
        EnclaveTable {
            slots: core::array::from_fn(|_| Enclave::invalid()),
        }
    }

    /// Returns the slot if the enclave exists.
    pub(crate) fn get(&self, eid: EnclaveId) -> Option<&Enclave> {
        self.slots.get(eid).filter(|slot| slot.exists())
    }

    /// Returns the slot mutably if the enclave exists.
    pub(crate) fn get_mut(&mut self, eid: EnclaveId) -> Option<&mut Enclave> {
        self.slots.get_mut(eid).filter(|slot| slot.exists())
    }
}

/// A fixed-size view of an enclave's memory segments, used to bound caller copies.
pub(crate) struct RegionSegments {
    segments: [Segment; config::ENCLAVE_REGIONS_MAX],
    len: usize,
}

impl RegionSegments {
    pub(crate) fn as_slice(&self) -> &[Segment] {
        &self.segments[..self.len]
    }
}

// ————————————————————————————— Security Monitor ——————————————————————————— //

/// The security monitor: the enclave table, the PMP manager, and the monitor identity.
pub struct SecurityMonitor {
    /// The single global lock serializing all state-machine transitions.
    enclaves: Mutex<EnclaveTable>,
    pub(crate) pmp: PmpManager,
    pub(crate) identity: SmIdentity,
    sm_region: Once<(RegionId, Segment)>,
    osm_region: Once<RegionId>,
    rng: Mutex<u64>,
}

impl SecurityMonitor {
    pub fn new(identity: SmIdentity) -> Self {
        SecurityMonitor {
            enclaves: Mutex::new(EnclaveTable::new()),
            pmp: PmpManager::new(),
            identity,
            sm_region: Once::new(),
            osm_region: Once::new(),
            rng: Mutex::new(Arch::cycle_count() as u64 | 1),
        }
    }

    /// Reserves the monitor's own memory at the highest PMP priority and installs the host's
    /// catch-all region at the lowest.
    pub fn protect_monitor_memory(&self, start: usize, size: usize) -> Result<(), SmError> {
        let sm_rid = self.pmp.region_init(start, size, PmpPriority::Top)?;
        let osm_rid = self.pmp.region_init(0, usize::MAX, PmpPriority::Bottom)?;

        // The host may access everything except the monitor itself.
        self.pmp.set_global(osm_rid, PMP_ALL_PERM);

        self.sm_region.call_once(|| (sm_rid, Segment::new(start, size)));
        self.osm_region.call_once(|| osm_rid);
        Ok(())
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, EnclaveTable> {
        self.enclaves.lock()
    }

    pub(crate) fn osm_rid(&self) -> RegionId {
        *self
            .osm_region
            .get()
            .expect("The monitor memory is not protected")
    }

    /// The monitor's own memory segment, used to reject host arguments overlapping it.
    pub(crate) fn sm_memory(&self) -> Segment {
        self.sm_region
            .get()
            .expect("The monitor memory is not protected")
            .1
    }

    pub(crate) fn region_segments(&self, slot: &Enclave) -> RegionSegments {
        let mut segments = [Segment::new(0, 0); config::ENCLAVE_REGIONS_MAX];
        let mut len = 0;
        for region in slot.regions.iter().flatten() {
            segments[len] = self.pmp.region_segment(region.pmp_rid);
            len += 1;
        }
        RegionSegments { segments, len }
    }

    /// A machine word of entropy.
    pub fn random_word(&self) -> usize {
        // splitmix64 step over a cycle-counter seeded state.
        let mut state = self.rng.lock();
        *state = state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = *state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        (z ^ (z >> 31)) as usize
    }

    #[cfg(any(test, feature = "userspace"))]
    pub fn enclave_state(&self, eid: EnclaveId) -> EnclaveState {
        let table = self.enclaves.lock();
        table
            .slots
            .get(eid)
            .map(|slot| slot.state)
            .unwrap_or(EnclaveState::Invalid)
    }

    // ———————————————————————————— EID Allocation —————————————————————————— //

    fn alloc_eid(&self) -> Result<EnclaveId, SmError> {
        let mut table = self.enclaves.lock();
        for (eid, slot) in table.slots.iter_mut().enumerate() {
            if slot.state == EnclaveState::Invalid {
                slot.state = EnclaveState::Allocated;
                return Ok(eid);
            }
        }
        Err(SmError::NoFreeResource)
    }

    fn free_eid(&self, eid: EnclaveId) {
        let mut table = self.enclaves.lock();
        table.slots[eid].state = EnclaveState::Invalid;
    }

    // ——————————————————————————————— Creation ————————————————————————————— //

    /// Creates a new enclave from host-provided physical memory.
    ///
    /// On success the slot is `Fresh`: validated, measured, and carrying its identity chain. On
    /// any failure every prior side effect is rolled back in reverse order.
    pub fn create_enclave(&self, args: CreateArgs) -> Result<EnclaveId, SmError> {
        if !is_create_args_valid(&args) {
            return Err(SmError::IllegalArgument);
        }

        let base = args.epm_region.paddr;
        let size = args.epm_region.size;
        let utbase = args.utm_region.paddr;
        let utsize = args.utm_region.size;

        let params = RuntimeParams {
            dram_base: base,
            dram_size: size,
            runtime_base: args.runtime_paddr,
            user_base: args.user_paddr,
            free_base: args.free_paddr,
            untrusted_base: utbase,
            untrusted_size: utsize,
            free_requested: args.free_requested,
        };

        log::debug!("Creating enclave (EPM 0x{:x}, {} bytes)", base, size);

        let eid = self.alloc_eid()?;

        // A PMP region bound to the enclave, and one for the shared memory.
        let epm_rid = match self.pmp.region_init(base, size, PmpPriority::Any) {
            Ok(rid) => rid,
            Err(err) => {
                self.free_eid(eid);
                return Err(err);
            }
        };
        let utm_rid = match self.pmp.region_init(utbase, utsize, PmpPriority::Bottom) {
            Ok(rid) => rid,
            Err(err) => {
                self.pmp.region_free(epm_rid);
                self.free_eid(eid);
                return Err(err);
            }
        };

        // The private region is inaccessible on every hart until destruction, the shared region
        // stays open to the host.
        self.pmp.set_global(epm_rid, PMP_NO_PERM);
        self.pmp.set_global(utm_rid, PMP_ALL_PERM);

        // The shared memory may be in an indeterminate state.
        mem::zero_region(utbase, utsize);

        let mut table = self.enclaves.lock();
        let slot = &mut table.slots[eid];
        slot.eid = eid;
        slot.regions[0] = Some(EnclaveRegion {
            kind: RegionType::Epm,
            pmp_rid: epm_rid,
        });
        slot.regions[1] = Some(EnclaveRegion {
            kind: RegionType::Utm,
            pmp_rid: utm_rid,
        });
        slot.encl_satp = satp::encode(base);
        slot.n_thread = 0;
        slot.params = params;
        slot.threads[0] = ThreadState::clean();

        // The platform hook runs last before measurement, it may amend the slot.
        if let Err(err) = Plat::create_enclave_hook(slot) {
            slot.reset();
            drop(table);
            self.rollback_regions(epm_rid, utm_rid);
            return Err(err);
        }

        // Validate memory, prepare hash and certificate for attestation. The slot is still
        // `Allocated` so no other operation can reach it while the lock is held.
        let epm_segment = Segment::new(base, size);
        let utm_segment = Segment::new(utbase, utsize);
        let hash = match measure::validate_and_hash(&slot.params, slot.encl_satp, epm_segment, utm_segment)
        {
            Ok(hash) => hash,
            Err(err) => {
                slot.reset();
                drop(table);
                self.rollback_regions(epm_rid, utm_rid);
                return Err(err);
            }
        };
        slot.hash = hash;

        slot.cdi = identity::derive_cdi(&identity::PARENT_CDI, &slot.hash);
        let lak = identity::lak_from_cdi(&slot.cdi);
        slot.local_att_pub = lak.verifying_key().to_bytes();
        slot.local_att_priv = lak.to_keypair_bytes();

        match identity::issue_lak_certificate(eid, &slot.hash, &slot.local_att_pub, self.identity.sm_key())
        {
            Ok(cert) => slot.crt_local_att = cert,
            Err(err) => {
                slot.reset();
                drop(table);
                self.rollback_regions(epm_rid, utm_rid);
                return Err(err);
            }
        }
        slot.n_keypair = 0;

        // The enclave is fresh: validated and measured but not run yet.
        slot.state = EnclaveState::Fresh;
        log::info!("Created enclave {}", eid);
        Ok(eid)
    }

    fn rollback_regions(&self, epm_rid: RegionId, utm_rid: RegionId) {
        self.pmp.region_free(utm_rid);
        self.pmp.region_free(epm_rid);
    }

    // —————————————————————————— Run / Stop / Resume ——————————————————————— //

    /// First entry into a fresh enclave.
    pub fn run_enclave(
        &self,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        eid: EnclaveId,
    ) -> Result<(), SmError> {
        let mut table = self.enclaves.lock();
        let slot = match table.get_mut(eid) {
            Some(slot) if slot.state == EnclaveState::Fresh => slot,
            _ => return Err(SmError::NotFresh),
        };
        slot.state = EnclaveState::Running;
        slot.n_thread = 1;

        context::enter_enclave(slot, &self.pmp, self.osm_rid(), hart, regs, true);
        Ok(())
    }

    /// Re-entry into a stopped (or, under the permissive policy, running) enclave.
    pub fn resume_enclave(
        &self,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        eid: EnclaveId,
    ) -> Result<(), SmError> {
        let mut table = self.enclaves.lock();
        let slot = table.get_mut(eid).ok_or(SmError::NotResumable)?;

        let state_ok = slot.state == EnclaveState::Stopped
            || (!config::RESUME_REQUIRES_STOPPED && slot.state == EnclaveState::Running);
        if !state_ok || slot.n_thread >= config::MAX_ENCL_THREADS {
            return Err(SmError::NotResumable);
        }
        slot.n_thread += 1;
        slot.state = EnclaveState::Running;

        context::enter_enclave(slot, &self.pmp, self.osm_rid(), hart, regs, false);
        Ok(())
    }

    /// Yields the calling hart back to the host, keeping the enclave resumable.
    ///
    /// The returned "error" is the control code the host observes as the return value of its
    /// `run` or `resume` call.
    pub fn stop_enclave(
        &self,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        request: usize,
        eid: EnclaveId,
    ) -> Result<(), SmError> {
        let mut table = self.enclaves.lock();
        let slot = match table.get_mut(eid) {
            Some(slot) if slot.state == EnclaveState::Running => slot,
            _ => return Err(SmError::NotRunning),
        };
        slot.n_thread -= 1;
        if slot.n_thread == 0 {
            slot.state = EnclaveState::Stopped;
        }

        let return_on_resume = request == stop::STOP_EDGE_CALL_HOST;
        context::exit_enclave(slot, &self.pmp, self.osm_rid(), hart, regs, return_on_resume);
        drop(table);

        match request {
            stop::STOP_TIMER_INTERRUPT => Err(SmError::Interrupted),
            stop::STOP_EDGE_CALL_HOST => Err(SmError::EdgeCallHost),
            _ => Err(SmError::UnknownError),
        }
    }

    /// Terminates the calling hart's enclave thread and returns to the host.
    pub fn exit_enclave(
        &self,
        hart: &mut HartCtx,
        regs: &mut TrapRegs,
        eid: EnclaveId,
    ) -> Result<(), SmError> {
        let mut table = self.enclaves.lock();
        let slot = match table.get_mut(eid) {
            Some(slot) if slot.state == EnclaveState::Running => slot,
            _ => return Err(SmError::NotRunning),
        };
        slot.n_thread -= 1;
        if slot.n_thread == 0 {
            slot.state = EnclaveState::Stopped;
        }

        context::exit_enclave(slot, &self.pmp, self.osm_rid(), hart, regs, false);
        Ok(())
    }

    // —————————————————————————————— Destruction ——————————————————————————— //

    /// Fully destroys an enclave: zeroes its private memory, frees the PMP regions, and releases
    /// the slot. Fails if the enclave is running.
    pub fn destroy_enclave(&self, eid: EnclaveId) -> Result<(), SmError> {
        let mut table = self.enclaves.lock();
        let regions = match table.get_mut(eid) {
            Some(slot) if slot.state <= EnclaveState::Stopped => {
                // Update the state first so that no hart can run the enclave any longer.
                slot.state = EnclaveState::Destroying;
                Plat::destroy_enclave_hook(slot);
                slot.regions
            }
            _ => return Err(SmError::NotDestroyable),
        };
        drop(table);

        // Clear all data in the private regions before freeing them. No lock needed: the slot is
        // `Destroying`, so this path is the single runner.
        for region in regions.iter().flatten() {
            if region.kind == RegionType::Utm {
                continue;
            }
            let base = self.pmp.region_addr(region.pmp_rid);
            let size = self.pmp.region_size(region.pmp_rid);
            mem::zero_region(base, size);
            self.pmp.set_global(region.pmp_rid, PMP_NO_PERM);
            self.pmp.region_free(region.pmp_rid);
        }

        // The shared memory stays host-visible, free it without zeroing.
        for region in regions.iter().flatten() {
            if region.kind == RegionType::Utm {
                self.pmp.region_free(region.pmp_rid);
            }
        }

        let mut table = self.enclaves.lock();
        table.slots[eid].reset();
        log::info!("Destroyed enclave {}", eid);
        Ok(())
    }
}

// ——————————————————————————— Argument Validation —————————————————————————— //

/// Checks the host-provided creation record.
fn is_create_args_valid(args: &CreateArgs) -> bool {
    if args.epm_region.size == 0 {
        return false;
    }

    // Range arithmetic must not overflow.
    let Some(epm_end) = args.epm_region.paddr.checked_add(args.epm_region.size) else {
        return false;
    };
    if args.utm_region.paddr.checked_add(args.utm_region.size).is_none() {
        return false;
    }

    // Runtime and user must lie inside the private memory, the free pointer may sit at its very
    // end when no free memory remains.
    let epm_start = args.epm_region.paddr;
    if args.runtime_paddr < epm_start || args.runtime_paddr >= epm_end {
        return false;
    }
    if args.user_paddr < epm_start || args.user_paddr >= epm_end {
        return false;
    }
    if args.free_paddr < epm_start || args.free_paddr > epm_end {
        return false;
    }

    // Check the order of the physical addresses.
    if args.runtime_paddr > args.user_paddr {
        return false;
    }
    if args.user_paddr > args.free_paddr {
        return false;
    }

    true
}

// ————————————————————————————————— Tests —————————————————————————————————— //
