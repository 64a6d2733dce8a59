//! Buffer attribute lists, reconciliation and shared buffer objects.
//!
//! Every endpoint publishes a `BufAttrs` per packet element; the pool merges
//! producer and consumer requirements into one allocated list per element and
//! allocates `BufObj`s from it. A `BufObj` is a handle onto shared storage:
//! duplicating it is cheap and every duplicate sees the same bytes. Access is
//! ordered by fences at the protocol level; the interior lock only upholds
//! memory safety.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufKind {
    Raw,
    Image,
}

/// Buffer access permission. Reconciliation takes the strongest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessPerm {
    Readonly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageLayout {
    BlockLinear,
    Pitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceFormat {
    /// 8-bit YUV 4:2:0 with interleaved UV plane.
    Yuv420SemiPlanar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaneFormat {
    Y8,
    U8V8,
}

/// Unreconciled buffer requirements for one packet element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufAttrs {
    pub kind: Option<BufKind>,
    pub perm: Option<AccessPerm>,
    pub need_cpu_access: bool,
    /// Raw buffers: requested byte size.
    pub size: Option<u64>,
    pub align: u64,
    /// Image buffers: geometry requirements.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<SurfaceFormat>,
    pub layout: Option<ImageLayout>,
    /// GPU the buffer must be importable on.
    pub gpu: Option<u32>,
}

impl BufAttrs {
    pub fn new() -> Self {
        BufAttrs {
            align: 1,
            ..Default::default()
        }
    }

    pub fn raw(size: u64, align: u64) -> Self {
        BufAttrs {
            kind: Some(BufKind::Raw),
            size: Some(size),
            align: align.max(1),
            ..Default::default()
        }
    }

    pub fn image(width: u32, height: u32, format: SurfaceFormat, layout: ImageLayout) -> Self {
        BufAttrs {
            kind: Some(BufKind::Image),
            width: Some(width),
            height: Some(height),
            format: Some(format),
            layout: Some(layout),
            align: 1,
            ..Default::default()
        }
    }

    pub fn set_perm(&mut self, perm: AccessPerm) -> &mut Self {
        self.perm = Some(self.perm.map_or(perm, |p| p.max(perm)));
        self
    }

    pub fn set_need_cpu_access(&mut self, need: bool) -> &mut Self {
        self.need_cpu_access |= need;
        self
    }

    pub fn set_gpu(&mut self, gpu: u32) -> &mut Self {
        self.gpu = Some(gpu);
        self
    }

    /// Merge endpoint requirement lists into a single allocatable list.
    pub fn reconcile<'a>(lists: impl IntoIterator<Item = &'a BufAttrs>) -> Result<BufAttrs> {
        let mut out: Option<BufAttrs> = None;
        for l in lists {
            let out = match out.as_mut() {
                None => {
                    out = Some(l.clone());
                    continue;
                }
                Some(o) => o,
            };
            out.kind = merge_eq("buffer type", out.kind, l.kind)?;
            if let Some(p) = l.perm {
                out.set_perm(p);
            }
            out.need_cpu_access |= l.need_cpu_access;
            out.size = match (out.size, l.size) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            out.align = out.align.max(l.align);
            out.width = merge_eq("plane width", out.width, l.width)?;
            out.height = merge_eq("plane height", out.height, l.height)?;
            out.format = merge_eq("surface format", out.format, l.format)?;
            out.layout = merge_eq("image layout", out.layout, l.layout)?;
            out.gpu = match (out.gpu, l.gpu) {
                (Some(a), Some(b)) if a != b => {
                    return Err(StreamError::Reconcile(format!(
                        "conflicting gpu affinity {a} vs {b}"
                    )));
                }
                (a, b) => a.or(b),
            };
        }
        let out = out.ok_or_else(|| StreamError::Reconcile("no buffer attribute lists".into()))?;
        if out.kind.is_none() {
            return Err(StreamError::Reconcile("buffer type never specified".into()));
        }
        Ok(out)
    }

    fn geometry(&self) -> Result<Geometry> {
        match self.kind {
            Some(BufKind::Raw) => {
                let size = self
                    .size
                    .ok_or_else(|| StreamError::Reconcile("raw buffer without size".into()))?;
                Ok(Geometry {
                    size,
                    planes: Vec::new(),
                })
            }
            Some(BufKind::Image) => {
                let (w, h) = match (self.width, self.height) {
                    (Some(w), Some(h)) => (w, h),
                    _ => {
                        return Err(StreamError::Reconcile(
                            "image buffer without dimensions".into(),
                        ));
                    }
                };
                match self.format {
                    Some(SurfaceFormat::Yuv420SemiPlanar) => {
                        if w % 2 != 0 || h % 2 != 0 {
                            return Err(StreamError::Reconcile(format!(
                                "odd dimensions {w}x{h} for 4:2:0 surface"
                            )));
                        }
                        let planes = vec![
                            PlaneDesc {
                                format: PlaneFormat::Y8,
                                width: w,
                                height: h,
                                pitch: w,
                                offset: 0,
                                bits_per_pixel: 8,
                            },
                            PlaneDesc {
                                format: PlaneFormat::U8V8,
                                width: w / 2,
                                height: h / 2,
                                pitch: w,
                                offset: (w as u64) * (h as u64),
                                bits_per_pixel: 16,
                            },
                        ];
                        Ok(Geometry {
                            size: (w as u64) * (h as u64) * 3 / 2,
                            planes,
                        })
                    }
                    None => Err(StreamError::Reconcile("image buffer without format".into())),
                }
            }
            None => Err(StreamError::Reconcile("buffer type never specified".into())),
        }
    }
}

fn merge_eq<T: PartialEq + Copy + std::fmt::Debug>(
    what: &str,
    a: Option<T>,
    b: Option<T>,
) -> Result<Option<T>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(StreamError::Reconcile(format!(
            "conflicting {what}: {x:?} vs {y:?}"
        ))),
        (a, b) => Ok(a.or(b)),
    }
}

/// One image plane of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDesc {
    pub format: PlaneFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub offset: u64,
    pub bits_per_pixel: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Geometry {
    size: u64,
    planes: Vec<PlaneDesc>,
}

/// Process-wide buffer module handle with live-object accounting.
#[derive(Clone)]
pub struct BufModule {
    live: Arc<AtomicUsize>,
}

impl BufModule {
    pub fn open() -> Self {
        BufModule {
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate storage for a reconciled attribute list.
    pub fn alloc(&self, attrs: &BufAttrs) -> Result<BufObj> {
        let geometry = attrs.geometry()?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(BufObj {
            core: Arc::new(BufCore {
                attrs: attrs.clone(),
                planes: geometry.planes,
                data: RwLock::new(BytesMut::zeroed(geometry.size as usize)),
                live: self.live.clone(),
            }),
        })
    }

    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

struct BufCore {
    attrs: BufAttrs,
    planes: Vec<PlaneDesc>,
    data: RwLock<BytesMut>,
    live: Arc<AtomicUsize>,
}

impl Drop for BufCore {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle onto shared buffer storage. `dup()` is the sanctioned way to hold
/// on to a buffer beyond the call that delivered it.
#[derive(Clone)]
pub struct BufObj {
    core: Arc<BufCore>,
}

impl BufObj {
    pub fn attrs(&self) -> &BufAttrs {
        &self.core.attrs
    }

    pub fn planes(&self) -> &[PlaneDesc] {
        &self.core.planes
    }

    pub fn size(&self) -> usize {
        self.core.data.read().unwrap().len()
    }

    /// Duplicate the handle; both handles refer to the same storage.
    pub fn dup(&self) -> BufObj {
        BufObj {
            core: Arc::clone(&self.core),
        }
    }

    pub fn same_buffer(&self, other: &BufObj) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn with_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.core.data.read().unwrap())
    }

    pub fn with_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.core.data.write().unwrap())
    }

    /// Copy the current contents out. Used at process boundaries where the
    /// storage itself cannot be shared.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.core.data.read().unwrap())
    }

    pub fn copy_from_slice(&self, src: &[u8]) -> Result<()> {
        let mut data = self.core.data.write().unwrap();
        if data.len() != src.len() {
            return Err(StreamError::Protocol(format!(
                "payload size {} does not match buffer size {}",
                src.len(),
                data.len()
            )));
        }
        data.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_geometry() {
        let attrs = BufAttrs::image(
            64,
            32,
            SurfaceFormat::Yuv420SemiPlanar,
            ImageLayout::BlockLinear,
        );
        let module = BufModule::open();
        let buf = module.alloc(&attrs).unwrap();
        assert_eq!(buf.size(), 64 * 32 * 3 / 2);
        assert_eq!(buf.planes().len(), 2);
        assert_eq!(buf.planes()[1].offset, 64 * 32);
        assert_eq!(buf.planes()[1].width, 32);
    }

    #[test]
    fn reconcile_takes_strongest_perm_and_layout_must_match() {
        let mut producer = BufAttrs::image(
            64,
            32,
            SurfaceFormat::Yuv420SemiPlanar,
            ImageLayout::BlockLinear,
        );
        producer.set_perm(AccessPerm::ReadWrite);
        let mut consumer = BufAttrs::new();
        consumer.kind = Some(BufKind::Image);
        consumer.set_perm(AccessPerm::Readonly);
        consumer.set_need_cpu_access(true);

        let merged = BufAttrs::reconcile([&producer, &consumer]).unwrap();
        assert_eq!(merged.perm, Some(AccessPerm::ReadWrite));
        assert!(merged.need_cpu_access);
        assert_eq!(merged.layout, Some(ImageLayout::BlockLinear));

        let mut pitch_consumer = consumer.clone();
        pitch_consumer.layout = Some(ImageLayout::Pitch);
        assert!(BufAttrs::reconcile([&producer, &pitch_consumer]).is_err());
    }

    #[test]
    fn reconcile_identical_inputs_is_identical() {
        let a = BufAttrs::raw(64, 8);
        let b = BufAttrs::raw(64, 8);
        let r1 = BufAttrs::reconcile([&a, &b]).unwrap();
        let r2 = BufAttrs::reconcile([&a, &b]).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn dup_shares_storage_and_module_counts() {
        let module = BufModule::open();
        let buf = module.alloc(&BufAttrs::raw(16, 1)).unwrap();
        let dup = buf.dup();
        buf.with_write(|d| d[0] = 0xAB);
        assert_eq!(dup.with_read(|d| d[0]), 0xAB);
        assert_eq!(module.live_objects(), 1);
        drop(buf);
        drop(dup);
        assert_eq!(module.live_objects(), 0);
    }
}
