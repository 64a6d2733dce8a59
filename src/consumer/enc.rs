//! Encoder consumer: registers packet images with the encode unit once,
//! feeds every other frame and drains the bitstream with a bounded pending
//! loop.

use std::fs::OpenOptions;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::buffer::{BufAttrs, BufKind, BufObj};
use crate::client::ClientCore;
use crate::config::{DUMP_END_FRAME, DUMP_START_FRAME, EncoderParams, MAX_PACKETS};
use crate::consumer::{ConsumerProcessor, DumpConfig};
use crate::encode::{BitsStatus, EncoderSyncRole, SoftEncoder, VideoEncoder};
use crate::error::{Result, StreamError};
use crate::sync::{Fence, SyncAttrs, SyncObj};

const BITSTREAM_TIMEOUT: Duration = Duration::from_secs(1);

pub struct EncProcessor {
    params: EncoderParams,
    dump: DumpConfig,
    encoder: Option<SoftEncoder>,
    images: Vec<Option<BufObj>>,
    encoded: Option<Vec<u8>>,
    output: Option<std::fs::File>,
}

impl EncProcessor {
    pub fn new(params: EncoderParams, dump: DumpConfig) -> EncProcessor {
        EncProcessor {
            params,
            dump,
            encoder: None,
            images: (0..MAX_PACKETS).map(|_| None).collect(),
            encoded: None,
            output: None,
        }
    }

    fn encoder(&self) -> Result<&SoftEncoder> {
        self.encoder
            .as_ref()
            .ok_or(StreamError::Hardware("encoder not initialized".into()))
    }

    fn encode_one_frame(&mut self, index: usize) -> Result<Fence> {
        let image = self.images[index]
            .as_ref()
            .ok_or(StreamError::Protocol(format!("packet {index} not registered")))?
            .dup();
        let encoder = self.encoder()?;
        encoder.feed_frame(&image)?;
        let postfence = encoder.eof_fence()?;

        // The encoder may report pending several times before the bitstream
        // is ready.
        let mut out = Vec::new();
        let deadline = Instant::now() + BITSTREAM_TIMEOUT;
        loop {
            match encoder.bits_available()? {
                BitsStatus::Ready(_) => {
                    encoder.get_bits(&mut out)?;
                    break;
                }
                BitsStatus::Pending => {
                    if Instant::now() >= deadline {
                        return Err(StreamError::Hardware("encoder stalled".into()));
                    }
                    debug!("bitstream pending");
                    thread::sleep(Duration::from_millis(1));
                }
                BitsStatus::NonePending => {
                    return Err(StreamError::Hardware("no encoded data is pending".into()));
                }
            }
        }
        self.encoded = Some(out);
        Ok(postfence)
    }
}

impl ConsumerProcessor for EncProcessor {
    fn init(&mut self, core: &ClientCore) -> Result<()> {
        self.encoder = Some(SoftEncoder::new(self.params.clone())?);
        if self.dump.enabled {
            let path = self.dump.file_path("multicast_enc", core.sensor, "h264");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    error!(client = %core.name, path = %path.display(), error = %e,
                           "failed to open output file");
                    StreamError::Io(e.to_string())
                })?;
            self.output = Some(file);
        }
        Ok(())
    }

    fn set_data_buf_attrs(&mut self, _core: &ClientCore, attrs: &mut BufAttrs) -> Result<()> {
        attrs.kind = Some(BufKind::Image);
        attrs.set_need_cpu_access(true);
        Ok(())
    }

    fn set_sync_attrs(
        &mut self,
        _core: &ClientCore,
        signaler: &mut SyncAttrs,
        waiter: &mut SyncAttrs,
    ) -> Result<()> {
        let encoder = self.encoder()?;
        encoder.fill_sync_attrs(EncoderSyncRole::Eof, signaler)?;
        encoder.fill_sync_attrs(EncoderSyncRole::Pre, waiter)?;
        Ok(())
    }

    fn map_data_buffer(&mut self, core: &ClientCore, index: usize) -> Result<()> {
        let packet = core.packet(index)?;
        let buf = packet.data_obj.as_ref().ok_or(StreamError::Protocol(
            "mapping a packet without a data buffer".into(),
        ))?;
        // Register with the encoder exactly once, at packet creation.
        self.encoder()?.register_image(buf)?;
        self.images[index] = Some(buf.dup());
        Ok(())
    }

    fn register_signal_sync(&mut self, _core: &ClientCore, obj: &SyncObj) -> Result<()> {
        self.encoder()?.register_sync(EncoderSyncRole::Eof, obj)
    }

    fn register_waiter_sync(
        &mut self,
        _core: &ClientCore,
        _index: usize,
        obj: &SyncObj,
    ) -> Result<()> {
        self.encoder()?.register_sync(EncoderSyncRole::Pre, obj)
    }

    fn unregister_syncs(&mut self, core: &ClientCore) -> Result<()> {
        if let (Some(encoder), Some(obj)) = (self.encoder.as_ref(), core.signal_obj.as_ref()) {
            encoder.unregister_sync(obj)?;
            for waiter in core.waiter_objs.iter().flatten() {
                encoder.unregister_sync(waiter)?;
            }
        }
        Ok(())
    }

    fn set_eof_sync(&mut self, core: &ClientCore) -> Result<()> {
        let obj = core
            .signal_obj
            .as_ref()
            .ok_or(StreamError::Protocol("signal object not allocated".into()))?;
        self.encoder()?.set_eof_sync(obj)
    }

    fn insert_prefence(&mut self, _index: usize, fence: &Fence) -> Result<()> {
        self.encoder()?.insert_prefence(fence)
    }

    /// Every other frame keeps the encoder within its throughput budget.
    fn skip_frame(&self, frame_num: u64) -> bool {
        frame_num % 2 != 0
    }

    fn process_payload(&mut self, _core: &ClientCore, index: usize) -> Result<Option<Fence>> {
        debug!(index, "process payload");
        self.encode_one_frame(index).map(Some)
    }

    fn on_payload_done(&mut self, core: &ClientCore, _index: usize, frame_num: u64) -> Result<()> {
        if (DUMP_START_FRAME..=DUMP_END_FRAME).contains(&frame_num) {
            if let (Some(file), Some(bits)) = (self.output.as_mut(), self.encoded.as_ref()) {
                if !bits.is_empty() {
                    file.write_all(bits).map_err(|e| {
                        error!(client = %core.name, error = %e, "dump write failed");
                        StreamError::Io(e.to_string())
                    })?;
                    debug!(bytes = bits.len(), frame = frame_num, "wrote bitstream");
                    file.flush().ok();
                }
            }
        }
        self.encoded = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_other_frame_is_encoded() {
        let proc = EncProcessor::new(EncoderParams::new(64, 48), DumpConfig::default());
        let encoded: Vec<u64> = (1..=100).filter(|f| !proc.skip_frame(*f)).collect();
        let expected: Vec<u64> = (1..=50).map(|i| i * 2).collect();
        assert_eq!(encoded, expected);
    }
}
