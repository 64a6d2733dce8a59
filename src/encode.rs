//! Video encoder contract and a deterministic software implementation.
//!
//! The consumer feeds registered images, retrieves an end-of-frame fence and
//! then polls the bitstream out; the encoder is free to report `Pending`
//! while a frame is still in flight. The software implementation produces
//! structurally valid Annex-B output (access-unit delimiter, SPS/PPS on IDR
//! frames, one slice per frame) so bitstream-shape checks are meaningful,
//! without pretending to be a real codec.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

use crate::buffer::BufObj;
use crate::config::{EncoderParams, RateControl, FENCE_FRAME_TIMEOUT};
use crate::error::{Result, StreamError};
use crate::sync::{device_wait, Fence, SyncAttrs, SyncHw, SyncObj, SyncPerm};

/// Role of a sync object at the encoder boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderSyncRole {
    /// Signaled when the encoder finishes reading a fed frame.
    Eof,
    /// Waited on before the encoder reads a fed frame.
    Pre,
}

/// Bitstream retrieval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitsStatus {
    Ready(usize),
    Pending,
    NonePending,
}

/// Contract between the encoder consumer and the hardware encode unit.
pub trait VideoEncoder: Send + Sync {
    fn fill_sync_attrs(&self, role: EncoderSyncRole, attrs: &mut SyncAttrs) -> Result<()>;
    fn register_sync(&self, role: EncoderSyncRole, obj: &SyncObj) -> Result<()>;
    fn unregister_sync(&self, obj: &SyncObj) -> Result<()>;
    fn register_image(&self, buf: &BufObj) -> Result<()>;
    fn set_eof_sync(&self, obj: &SyncObj) -> Result<()>;
    /// Stage a fence the encoder must wait on before reading the next frame.
    fn insert_prefence(&self, fence: &Fence) -> Result<()>;
    fn feed_frame(&self, buf: &BufObj) -> Result<()>;
    /// Fence for the most recently fed frame.
    fn eof_fence(&self) -> Result<Fence>;
    fn bits_available(&self) -> Result<BitsStatus>;
    fn get_bits(&self, out: &mut Vec<u8>) -> Result<usize>;
}

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_AUD: u8 = 0x09;
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;

struct EncodeJob {
    buf: BufObj,
    prefences: Vec<Fence>,
    eof: Option<(SyncObj, u64)>,
    frame_index: u64,
}

struct SoftState {
    registered: Vec<BufObj>,
    eof_sync: Option<SyncObj>,
    staged_prefences: Vec<Fence>,
    last_eof: Option<Fence>,
    in_flight: usize,
    ready: VecDeque<Vec<u8>>,
    frames_fed: u64,
}

/// Worker-thread software encoder with the pass-through parameter block.
pub struct SoftEncoder {
    params: EncoderParams,
    state: Arc<Mutex<SoftState>>,
    jobs: Sender<EncodeJob>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SoftEncoder {
    pub fn new(params: EncoderParams) -> Result<SoftEncoder> {
        if params.width == 0 || params.height == 0 {
            return Err(StreamError::Config("encoder with zero dimensions".into()));
        }
        if params.gop_length == 0 {
            return Err(StreamError::Config("encoder with zero GOP length".into()));
        }
        let state = Arc::new(Mutex::new(SoftState {
            registered: Vec::new(),
            eof_sync: None,
            staged_prefences: Vec::new(),
            last_eof: None,
            in_flight: 0,
            ready: VecDeque::new(),
            frames_fed: 0,
        }));
        let (jobs, rx) = unbounded::<EncodeJob>();
        let worker_state = Arc::clone(&state);
        let worker_params = params.clone();
        let worker = thread::Builder::new()
            .name("softenc".into())
            .spawn(move || {
                for job in rx {
                    let bitstream = encode_one(&worker_params, &job);
                    if let Some((obj, value)) = &job.eof {
                        obj.signal_to(*value);
                    }
                    let mut st = worker_state.lock().unwrap();
                    st.in_flight -= 1;
                    match bitstream {
                        Ok(bits) => st.ready.push_back(bits),
                        Err(e) => {
                            debug!(error = %e, "encode job failed");
                        }
                    }
                }
            })
            .map_err(|e| StreamError::Hardware(e.to_string()))?;
        Ok(SoftEncoder {
            params,
            state,
            jobs,
            worker: Some(worker),
        })
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }
}

impl Drop for SoftEncoder {
    fn drop(&mut self) {
        let (closed, _) = unbounded();
        let _ = std::mem::replace(&mut self.jobs, closed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Luma sampling stride for one frame, derived from the rate control: CBR
/// aims the slice payload at `bitrate / 8 / fps` bytes, constant QP trades
/// quality for size directly.
fn payload_step(params: &EncoderParams, luma_len: usize) -> usize {
    match params.rate_control {
        RateControl::ConstQp { qp } => (usize::from(qp.min(params.max_qp)) / 2).max(1),
        RateControl::Cbr { average_bitrate } => {
            let num = u64::from(params.frame_rate_num.max(1));
            let den = u64::from(params.frame_rate_den.max(1));
            let budget = ((u64::from(average_bitrate) / 8) * den / num).max(1) as usize;
            (luma_len / budget).max(1)
        }
    }
}

fn encode_one(params: &EncoderParams, job: &EncodeJob) -> Result<Vec<u8>> {
    for fence in &job.prefences {
        device_wait(fence, FENCE_FRAME_TIMEOUT)?;
    }
    let idr = job.frame_index % u64::from(params.gop_length) == 0;
    let mut out = Vec::new();

    out.extend_from_slice(&START_CODE);
    out.push(NAL_AUD);
    out.push(if idr { 0x10 } else { 0x30 });

    if idr || params.repeat_spspps && job.frame_index % u64::from(params.idr_period) == 0 {
        out.extend_from_slice(&START_CODE);
        out.push(NAL_SPS);
        out.extend_from_slice(&(params.width as u16).to_be_bytes());
        out.extend_from_slice(&(params.height as u16).to_be_bytes());
        out.push(params.gop_length as u8);
        out.extend_from_slice(&START_CODE);
        out.push(NAL_PPS);
        out.push(params.max_qp);
    }

    out.extend_from_slice(&START_CODE);
    out.push(if idr { NAL_IDR } else { NAL_SLICE });
    out.extend_from_slice(&(job.frame_index as u32).to_be_bytes());

    // Sample the luma plane at the rate-control stride. Payload bytes are
    // biased above 0x80 so no start-code emulation can occur.
    let luma_len = match job.buf.planes().first() {
        Some(p) => (p.pitch as usize) * (p.height as usize),
        None => job.buf.size(),
    };
    let step = payload_step(params, luma_len);
    job.buf.with_read(|data| {
        for i in (0..luma_len.min(data.len())).step_by(step) {
            out.push(0x80 | (data[i] >> 1));
        }
    });
    Ok(out)
}

impl VideoEncoder for SoftEncoder {
    fn fill_sync_attrs(&self, role: EncoderSyncRole, attrs: &mut SyncAttrs) -> Result<()> {
        match role {
            EncoderSyncRole::Eof => attrs.set_perm(SyncPerm::SignalOnly),
            EncoderSyncRole::Pre => attrs.set_perm(SyncPerm::WaitOnly),
        };
        attrs.add_hw(SyncHw::Encoder);
        Ok(())
    }

    fn register_sync(&self, _role: EncoderSyncRole, _obj: &SyncObj) -> Result<()> {
        Ok(())
    }

    fn unregister_sync(&self, _obj: &SyncObj) -> Result<()> {
        Ok(())
    }

    fn register_image(&self, buf: &BufObj) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.registered.iter().any(|b| b.same_buffer(buf)) {
            return Err(StreamError::Hardware("image already registered".into()));
        }
        st.registered.push(buf.dup());
        Ok(())
    }

    fn set_eof_sync(&self, obj: &SyncObj) -> Result<()> {
        self.state.lock().unwrap().eof_sync = Some(obj.clone());
        Ok(())
    }

    fn insert_prefence(&self, fence: &Fence) -> Result<()> {
        self.state.lock().unwrap().staged_prefences.push(fence.clone());
        Ok(())
    }

    fn feed_frame(&self, buf: &BufObj) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if !st.registered.iter().any(|b| b.same_buffer(buf)) {
            return Err(StreamError::Hardware("frame image was never registered".into()));
        }
        let eof_raw = st.eof_sync.as_ref().map(|obj| {
            let fence = obj.generate_fence();
            (obj.clone(), fence.value(), fence)
        });
        let eof = if let Some((obj, val, fence)) = eof_raw {
            st.last_eof = Some(fence);
            Some((obj, val))
        } else {
            st.last_eof = None;
            None
        };
        let job = EncodeJob {
            buf: buf.dup(),
            prefences: st.staged_prefences.drain(..).collect(),
            eof,
            frame_index: st.frames_fed,
        };
        st.frames_fed += 1;
        st.in_flight += 1;
        drop(st);
        self.jobs
            .send(job)
            .map_err(|_| StreamError::Hardware("encoder worker gone".into()))
    }

    fn eof_fence(&self) -> Result<Fence> {
        self.state
            .lock()
            .unwrap()
            .last_eof
            .clone()
            .ok_or(StreamError::Hardware("no frame has been fed".into()))
    }

    fn bits_available(&self) -> Result<BitsStatus> {
        let st = self.state.lock().unwrap();
        if let Some(front) = st.ready.front() {
            Ok(BitsStatus::Ready(front.len()))
        } else if st.in_flight > 0 {
            Ok(BitsStatus::Pending)
        } else {
            Ok(BitsStatus::NonePending)
        }
    }

    fn get_bits(&self, out: &mut Vec<u8>) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        let bits = st
            .ready
            .pop_front()
            .ok_or(StreamError::Hardware("no encoded data is pending".into()))?;
        let len = bits.len();
        out.extend_from_slice(&bits);
        Ok(len)
    }
}

/// Count occurrences of a NAL unit type in an Annex-B stream.
pub fn count_nal_units(stream: &[u8], nal: u8) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + 4 < stream.len() {
        if stream[i..i + 4] == START_CODE && stream[i + 4] == nal {
            count += 1;
        }
        i += 1;
    }
    count
}

/// NAL type byte for sequence parameter sets, for bitstream checks.
pub const SPS_NAL: u8 = NAL_SPS;
/// NAL type byte for picture parameter sets, for bitstream checks.
pub const PPS_NAL: u8 = NAL_PPS;
/// NAL type byte for IDR slices, for bitstream checks.
pub const IDR_NAL: u8 = NAL_IDR;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufAttrs, BufModule, ImageLayout, SurfaceFormat};

    fn encoder_with_frame() -> (SoftEncoder, BufObj) {
        let module = BufModule::open();
        let buf = module
            .alloc(&BufAttrs::image(
                32,
                16,
                SurfaceFormat::Yuv420SemiPlanar,
                ImageLayout::BlockLinear,
            ))
            .unwrap();
        let enc = SoftEncoder::new(EncoderParams::new(32, 16)).unwrap();
        enc.register_image(&buf).unwrap();
        (enc, buf)
    }

    fn pull_bits(enc: &SoftEncoder) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match enc.bits_available().unwrap() {
                BitsStatus::Ready(_) => {
                    enc.get_bits(&mut out).unwrap();
                    return out;
                }
                BitsStatus::Pending => std::thread::yield_now(),
                BitsStatus::NonePending => panic!("no encoded data"),
            }
        }
    }

    #[test]
    fn unregistered_image_is_rejected() {
        let module = BufModule::open();
        let (enc, _buf) = encoder_with_frame();
        let other = module
            .alloc(&BufAttrs::image(
                32,
                16,
                SurfaceFormat::Yuv420SemiPlanar,
                ImageLayout::BlockLinear,
            ))
            .unwrap();
        assert!(enc.feed_frame(&other).is_err());
    }

    #[test]
    fn idr_frames_carry_sps_pps_per_gop() {
        let (enc, buf) = encoder_with_frame();
        let mut stream = Vec::new();
        for _ in 0..33 {
            enc.feed_frame(&buf).unwrap();
            stream.extend_from_slice(&pull_bits(&enc));
        }
        // Frames 0, 16 and 32 are IDR with a GOP of 16.
        assert_eq!(count_nal_units(&stream, SPS_NAL), 3);
        assert_eq!(count_nal_units(&stream, PPS_NAL), 3);
        assert_eq!(count_nal_units(&stream, IDR_NAL), 3);
    }

    #[test]
    fn rate_control_shapes_the_payload_budget() {
        let module = BufModule::open();
        let buf = module
            .alloc(&BufAttrs::image(
                32,
                16,
                SurfaceFormat::Yuv420SemiPlanar,
                ImageLayout::BlockLinear,
            ))
            .unwrap();

        let one_frame = |params: EncoderParams| {
            let enc = SoftEncoder::new(params).unwrap();
            enc.register_image(&buf).unwrap();
            enc.feed_frame(&buf).unwrap();
            pull_bits(&enc).len()
        };

        // 7 680 bit/s at 30 fps is a 32-byte frame budget; the default
        // 8 Mbps budget covers the whole 512-byte luma plane.
        let mut lean = EncoderParams::new(32, 16);
        lean.rate_control = RateControl::Cbr {
            average_bitrate: 7_680,
        };
        assert!(one_frame(lean) < one_frame(EncoderParams::new(32, 16)));

        // A higher QP compresses harder.
        let coarse = EncoderParams::new(32, 16).with_const_qp(50);
        let fine = EncoderParams::new(32, 16).with_const_qp(4);
        assert!(one_frame(coarse) < one_frame(fine));
    }

    #[test]
    fn eof_fence_signals_after_encode() {
        use crate::sync::{SyncAttrs, SyncModule, SyncPerm};

        let (enc, buf) = encoder_with_frame();
        let module = SyncModule::open();
        let mut attrs = SyncAttrs::new();
        attrs.set_perm(SyncPerm::WaitSignal).set_need_cpu_access(true);
        let obj = module.alloc(&attrs).unwrap();
        enc.set_eof_sync(&obj).unwrap();

        enc.feed_frame(&buf).unwrap();
        let fence = enc.eof_fence().unwrap();
        let _bits = pull_bits(&enc);
        assert!(fence.is_signaled());
    }
}
