//! Remote block attach and chunked read (spec §4.F-H): a consumer attaches
//! to a block resource advertised by a server node, then reads more data
//! than fits in one `DEV_OP_REQ`, exercising [`chunk_lba_range`] the way a
//! real client would split a large read across several round trips.

use std::boxed::Box;
use std::sync::Mutex;
use std::vec::Vec;

use wki_abi::payload::{DevAttachAckPayload, DevAttachStatus};
use wki_abi::{DeviceOp, NodeId, ResourceType};
use wki_devproxy::{AttachPoll, DeviceProxy, chunk_lba_range};
use wki_devserver::{AttachOutcome, DeviceServer};
use wki_lib::collab::{self, BlockDevice, BlockRegistry};
use wki_resource::{FLAG_SHAREABLE, ResourceRegistry};

struct MemDisk {
    blocks: Mutex<Vec<[u8; 512]>>,
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> u32 {
        512
    }
    fn total_blocks(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }
    fn read(&self, lba: u64, buf: &mut [u8]) -> wki_abi::WkiResult<()> {
        let blocks = self.blocks.lock().unwrap();
        let block = blocks.get(lba as usize).ok_or(wki_abi::WkiError::InvalidArgument)?;
        let n = buf.len().min(block.len());
        buf[..n].copy_from_slice(&block[..n]);
        Ok(())
    }
    fn write(&self, _lba: u64, _buf: &[u8]) -> wki_abi::WkiResult<()> {
        Ok(())
    }
    fn flush(&self) -> wki_abi::WkiResult<()> {
        Ok(())
    }
}

struct FixedBlockRegistry(&'static MemDisk);

impl BlockRegistry for FixedBlockRegistry {
    fn can_remote(&self, resource_id: u32) -> bool {
        resource_id == 42
    }
    fn on_remote_attach(&self, _resource_id: u32) -> bool {
        true
    }
    fn on_remote_detach(&self, _resource_id: u32) {}
    fn lookup(&self, resource_id: u32) -> Option<&'static dyn BlockDevice> {
        (resource_id == 42).then_some(self.0)
    }
}

fn setup_disk(block_count: usize) -> &'static MemDisk {
    let mut blocks = Vec::with_capacity(block_count);
    for i in 0..block_count {
        let mut block = [0u8; 512];
        block[0] = i as u8;
        blocks.push(block);
    }
    let disk = Box::leak(Box::new(MemDisk { blocks: Mutex::new(blocks) }));
    collab::register_block_registry(Box::leak(Box::new(FixedBlockRegistry(disk))));
    disk
}

#[test]
fn attach_then_chunked_read_reassembles_the_full_range() {
    setup_disk(20);

    let server_resources = ResourceRegistry::new(NodeId(1));
    assert!(server_resources.advertise_local(ResourceType::Block, 42, b"disk0", FLAG_SHAREABLE));
    let server = DeviceServer::new();

    // Consumer side: begin the attach, server grants it.
    let proxy = DeviceProxy::new();
    let req = proxy.begin_attach(NodeId(1), ResourceType::Block, 42, 0).expect("slot available");
    let outcome = server.handle_attach_req(NodeId(2), &req, &server_resources, 512);
    let AttachOutcome::Ok { channel, max_op_size } = outcome else {
        panic!("expected attach to succeed, got {outcome:?}");
    };
    let ack = DevAttachAckPayload { status: DevAttachStatus::Ok as u8, assigned_channel: channel, max_op_size };
    proxy.on_attach_ack(NodeId(1), 42, &ack);
    assert!(matches!(proxy.poll_attach(NodeId(1), 42, 0), AttachPoll::Active { .. }));

    // Split a 20-block read into max_op_size-sized chunks and replay each
    // through a DEV_OP_REQ/DEV_OP_RESP round trip.
    let chunks = chunk_lba_range(0, 20, 512, max_op_size);
    assert!(chunks.len() > 1, "max_op_size=512 should force more than one chunk for 20 blocks");

    let mut reassembled = Vec::new();
    for (lba, count) in chunks {
        let mut req_data = [0u8; 12];
        req_data[0..8].copy_from_slice(&lba.to_le_bytes());
        req_data[8..12].copy_from_slice(&count.to_le_bytes());
        let mut out = [0u8; 512];
        let resp = server.handle_op_req(NodeId(2), channel, DeviceOp::BlockRead, &req_data, &mut out);
        assert_eq!(resp.status, 0);
        reassembled.extend_from_slice(&out[..resp.data_len]);
    }

    assert_eq!(reassembled.len(), 512 * 20);
    for (i, block) in reassembled.chunks(512).enumerate() {
        assert_eq!(block[0], i as u8);
    }
}

#[test]
fn attach_to_unknown_resource_is_rejected() {
    setup_disk(1);
    let server_resources = ResourceRegistry::new(NodeId(1));
    let server = DeviceServer::new();
    let proxy = DeviceProxy::new();

    let req = proxy.begin_attach(NodeId(1), ResourceType::Block, 99, 0).unwrap();
    let outcome = server.handle_attach_req(NodeId(2), &req, &server_resources, 512);
    assert_eq!(outcome, AttachOutcome::NotFound);

    let ack = DevAttachAckPayload { status: DevAttachStatus::NotFound as u8, assigned_channel: 0, max_op_size: 0 };
    proxy.on_attach_ack(NodeId(1), 99, &ack);
    assert!(matches!(proxy.poll_attach(NodeId(1), 99, 0), AttachPoll::Rejected(DevAttachStatus::NotFound)));
}
