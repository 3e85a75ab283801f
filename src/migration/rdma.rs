//! One-sided RDMA migration transport (cargo feature `rdma`).
//!
//! Control records (parameters, metadata, region list, vCPU states, clock)
//! still travel over the TCP stream; guest pages move as one-sided RDMA
//! write work-requests against memory regions the destination registered
//! and advertised during the verbs handshake. Because writes are one-sided
//! the destination never touches a page on the data path — it only waits
//! for the solicited completion of the final write, which carries immediate
//! data as the last-page marker.
//!
//! Work-requests never exceed the port's `max_msg_sz`; larger records are
//! split. Transport errors terminate the migration (there is no graceful
//! downgrade once pages have moved one-sided).

use std::io;
use std::mem::MaybeUninit;
use std::ptr;

use vm_memory::ByteValued;

use super::stream::StreamTransport;
use super::{MigrationError, Transport};
use crate::mem::{GuestMemory, MemChunk};
use crate::paging::{record_dest_offset, record_page_size};

use rdma_sys::*;

/// Queue depth of the send queue; completions are mostly unsignaled.
const SEND_QUEUE_DEPTH: u32 = 4096;
/// Immediate data of the last-page write.
const LAST_PAGE_IMM: u32 = 0x1;

/// Per-side connection info exchanged over the control stream.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
struct PeerInfo {
    lid: u16,
    _pad: u16,
    qpn: u32,
    psn: u32,
    nregions: u32,
    /// Base/rkey of the peer's guest-memory regions (one per chunk).
    addr: [u64; 2],
    rkey: [u32; 2],
}

unsafe impl ByteValued for PeerInfo {}

struct RegisteredRegion {
    mr: *mut ibv_mr,
    chunk: MemChunk,
}

/// The verbs endpoint shared by both sides.
pub struct RdmaTransport {
    control: StreamTransport,
    context: *mut ibv_context,
    pd: *mut ibv_pd,
    cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    regions: Vec<RegisteredRegion>,
    peer: PeerInfo,
    max_msg_sz: u64,
    host_base: u64,
    /// Pending unsignaled work-requests since the last CQ drain.
    outstanding: u32,
}

// Raw verbs handles are only ever used from the migration thread.
unsafe impl Send for RdmaTransport {}

impl RdmaTransport {
    /// Upgrade an established control stream to a verbs endpoint: register
    /// guest memory, exchange endpoint/region info, connect the queue
    /// pair. Runs after the metadata handshake on both sides (the
    /// destination has no guest memory to register before that).
    pub fn from_control(
        mut control: StreamTransport,
        mem: &GuestMemory,
        use_odp: bool,
    ) -> Result<Self, MigrationError> {
        unsafe {
            let mut num_devices = 0;
            let devices = ibv_get_device_list(&mut num_devices);
            if devices.is_null() || num_devices == 0 {
                return Err(verbs_error("no RDMA devices"));
            }
            let context = ibv_open_device(*devices);
            ibv_free_device_list(devices);
            if context.is_null() {
                return Err(verbs_error("ibv_open_device"));
            }

            let mut port_attr = MaybeUninit::<ibv_port_attr>::zeroed().assume_init();
            if ibv_query_port(context, 1, &mut port_attr as *mut _ as *mut _) != 0 {
                return Err(verbs_error("ibv_query_port"));
            }

            let pd = ibv_alloc_pd(context);
            if pd.is_null() {
                return Err(verbs_error("ibv_alloc_pd"));
            }

            let cq = ibv_create_cq(
                context,
                SEND_QUEUE_DEPTH as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if cq.is_null() {
                return Err(verbs_error("ibv_create_cq"));
            }

            let mut qp_init = MaybeUninit::<ibv_qp_init_attr>::zeroed().assume_init();
            qp_init.send_cq = cq;
            qp_init.recv_cq = cq;
            qp_init.qp_type = ibv_qp_type::IBV_QPT_RC;
            qp_init.cap.max_send_wr = SEND_QUEUE_DEPTH;
            qp_init.cap.max_recv_wr = 16;
            qp_init.cap.max_send_sge = 1;
            qp_init.cap.max_recv_sge = 1;
            let qp = ibv_create_qp(pd, &mut qp_init);
            if qp.is_null() {
                return Err(verbs_error("ibv_create_qp"));
            }

            // Register every non-hole chunk of guest memory. On-demand
            // paging skips the pin-down at registration time.
            let mut access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
            if use_odp {
                access |= ibv_access_flags::IBV_ACCESS_ON_DEMAND.0;
            }
            let mut regions = Vec::new();
            for chunk in mem.chunks() {
                let addr = (mem.host_base() + chunk.gpa) as *mut libc::c_void;
                let mr = ibv_reg_mr(pd, addr, chunk.size as usize, access as i32);
                if mr.is_null() {
                    return Err(verbs_error("ibv_reg_mr"));
                }
                regions.push(RegisteredRegion { mr, chunk });
            }

            // Advertise our endpoint and regions; learn the peer's.
            let mut local = PeerInfo {
                lid: port_attr.lid,
                qpn: (*qp).qp_num,
                psn: 0,
                nregions: regions.len() as u32,
                ..Default::default()
            };
            for (i, region) in regions.iter().enumerate() {
                local.rkey[i] = (*region.mr).rkey;
                local.addr[i] = (*region.mr).addr as u64;
            }
            control.send(local.as_slice())?;
            let mut peer = PeerInfo::default();
            control.recv(peer.as_mut_slice())?;

            let mut transport = Self {
                control,
                context,
                pd,
                cq,
                qp,
                regions,
                peer,
                max_msg_sz: port_attr.max_msg_sz as u64,
                host_base: mem.host_base(),
                outstanding: 0,
            };
            transport.to_rtr_rts()?;
            Ok(transport)
        }
    }

    /// INIT → RTR → RTS for the reliable-connected queue pair.
    unsafe fn to_rtr_rts(&mut self) -> Result<(), MigrationError> {
        let mut attr = MaybeUninit::<ibv_qp_attr>::zeroed().assume_init();
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = 1;
        attr.qp_access_flags = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE.0
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0
            | ibv_qp_attr_mask::IBV_QP_PORT.0
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS.0;
        if ibv_modify_qp(self.qp, &mut attr, mask as i32) != 0 {
            return Err(verbs_error("modify_qp INIT"));
        }

        let mut attr = MaybeUninit::<ibv_qp_attr>::zeroed().assume_init();
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ibv_mtu::IBV_MTU_4096;
        attr.dest_qp_num = self.peer.qpn;
        attr.rq_psn = self.peer.psn;
        attr.max_dest_rd_atomic = 1;
        attr.min_rnr_timer = 12;
        attr.ah_attr.dlid = self.peer.lid;
        attr.ah_attr.port_num = 1;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE.0
            | ibv_qp_attr_mask::IBV_QP_AV.0
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU.0
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN.0
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN.0
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC.0
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0;
        if ibv_modify_qp(self.qp, &mut attr, mask as i32) != 0 {
            return Err(verbs_error("modify_qp RTR"));
        }

        let mut attr = MaybeUninit::<ibv_qp_attr>::zeroed().assume_init();
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = 14;
        attr.retry_cnt = 7;
        attr.rnr_retry = 7;
        attr.sq_psn = 0;
        attr.max_rd_atomic = 1;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE.0
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT.0
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT.0
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY.0
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN.0
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC.0;
        if ibv_modify_qp(self.qp, &mut attr, mask as i32) != 0 {
            return Err(verbs_error("modify_qp RTS"));
        }
        Ok(())
    }

    /// Translate a guest offset into (local lkey, remote addr, rkey).
    fn locate(&self, offset: u64) -> Result<(u32, u64, u32), MigrationError> {
        for (i, region) in self.regions.iter().enumerate() {
            let chunk = region.chunk;
            if offset >= chunk.gpa && offset < chunk.gpa + chunk.size {
                let lkey = unsafe { (*region.mr).lkey };
                let remote = self.peer.addr[i] + (offset - chunk.gpa);
                return Ok((lkey, remote, self.peer.rkey[i]));
            }
        }
        Err(MigrationError::Protocol(format!(
            "page record outside every region: {offset:#x}"
        )))
    }

    /// Post one write work-request; signaled requests also drain the CQ.
    unsafe fn post_write(
        &mut self,
        local: u64,
        remote: u64,
        len: u64,
        lkey: u32,
        rkey: u32,
        last: bool,
    ) -> Result<(), MigrationError> {
        let mut sge = MaybeUninit::<ibv_sge>::zeroed().assume_init();
        sge.addr = local;
        sge.length = len as u32;
        sge.lkey = lkey;

        let mut wr = MaybeUninit::<ibv_send_wr>::zeroed().assume_init();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.wr.rdma.remote_addr = remote;
        wr.wr.rdma.rkey = rkey;
        if last {
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
            wr.send_flags =
                ibv_send_flags::IBV_SEND_SIGNALED.0 | ibv_send_flags::IBV_SEND_SOLICITED.0;
            wr.imm_data_invalidated_rkey_union.imm_data = LAST_PAGE_IMM.to_be();
        } else {
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
            // Sign every queue-depth-th request so the queue drains.
            self.outstanding += 1;
            if self.outstanding == SEND_QUEUE_DEPTH / 2 {
                wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            }
        }

        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        if ibv_post_send(self.qp, &mut wr, &mut bad) != 0 {
            return Err(verbs_error("ibv_post_send"));
        }
        if wr.send_flags & ibv_send_flags::IBV_SEND_SIGNALED.0 != 0 {
            self.wait_completion()?;
            self.outstanding = 0;
        }
        Ok(())
    }

    unsafe fn wait_completion(&mut self) -> Result<(), MigrationError> {
        let mut wc = MaybeUninit::<ibv_wc>::zeroed().assume_init();
        loop {
            let polled = ibv_poll_cq(self.cq, 1, &mut wc);
            if polled < 0 {
                return Err(verbs_error("ibv_poll_cq"));
            }
            if polled == 0 {
                continue;
            }
            if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
                return Err(MigrationError::Protocol(format!(
                    "work completion failed with status {:?}",
                    wc.status
                )));
            }
            return Ok(());
        }
    }
}

impl Transport for RdmaTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), MigrationError> {
        self.control.send(bytes)
    }

    fn recv(&mut self, bytes: &mut [u8]) -> Result<(), MigrationError> {
        self.control.recv(bytes)
    }

    fn send_page(&mut self, entry: u64, _page: &[u8]) -> Result<(), MigrationError> {
        let offset = record_dest_offset(entry);
        let size = record_page_size(entry);
        let (lkey, remote, rkey) = self.locate(offset)?;

        // One-sided: the data leaves straight from guest memory, split at
        // the NIC's maximum message size.
        let mut done = 0;
        while done < size {
            let len = (size - done).min(self.max_msg_sz);
            unsafe {
                self.post_write(
                    self.host_base + offset + done,
                    remote + done,
                    len,
                    lkey,
                    rkey,
                    false,
                )?;
            }
            done += len;
        }
        Ok(())
    }

    fn finish_pages(&mut self) -> Result<(), MigrationError> {
        // A zero-length write carrying immediate data; solicited so the
        // receiver wakes exactly once.
        let (lkey, remote, rkey) = self.locate(0)?;
        unsafe { self.post_write(self.host_base, remote, 0, lkey, rkey, true) }
    }

    fn recv_page(&mut self, _mem: &GuestMemory) -> Result<bool, MigrationError> {
        // Pages land one-sided; the only receive-side event is the
        // completion of the final immediate-data write.
        unsafe {
            let mut wr = MaybeUninit::<ibv_recv_wr>::zeroed().assume_init();
            let mut bad: *mut ibv_recv_wr = ptr::null_mut();
            if ibv_post_recv(self.qp, &mut wr, &mut bad) != 0 {
                return Err(verbs_error("ibv_post_recv"));
            }
            self.wait_completion()?;
        }
        Ok(false)
    }

    fn supports_live(&self) -> bool {
        true
    }
}

impl Drop for RdmaTransport {
    fn drop(&mut self) {
        unsafe {
            for region in &self.regions {
                ibv_dereg_mr(region.mr);
            }
            ibv_destroy_qp(self.qp);
            ibv_destroy_cq(self.cq);
            ibv_dealloc_pd(self.pd);
            ibv_close_device(self.context);
        }
    }
}

fn verbs_error(what: &str) -> MigrationError {
    MigrationError::Transport(io::Error::other(format!(
        "{what} failed: {}",
        io::Error::last_os_error()
    )))
}
