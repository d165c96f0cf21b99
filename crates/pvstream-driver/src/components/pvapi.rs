//! Prosilica GigE camera through the vendor PvAPI library.
//!
//! Each queued buffer travels with a boxed `tPvFrame` whose `Context[0]` points
//! back at the box. The SDK fills the buffer in place and calls
//! [`frame_done`] on its own thread, which unboxes the submission and hands the
//! buffer back through its completion handle.
//!
//! ## SDK Reference Counting
//!
//! `PvInitialize`/`PvUnInitialize` affect the whole process, so the SDK is only
//! uninitialized when the last camera closes.

#![allow(unsafe_code)]

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use pvapi_sys::*;
use pvstream_pool::{
    CaptureDevice, CompletionHandle, DeviceResult, FrameBuffer, FrameMetadata, FrameStatus,
    PixelFormat, Rejection,
};
use std::ffi::{c_char, c_void, CStr, CString};
use tracing::{debug, info, warn};

/// Open cameras; the SDK is initialized while this is non-zero.
static SDK_REF_COUNT: Mutex<usize> = parking_lot::const_mutex(0);

const ENUM_VALUE_LEN: usize = 64;

fn check(err: tPvErr) -> DeviceResult<()> {
    if err == ePvErrSuccess {
        Ok(())
    } else {
        Err(FrameStatus::from_code(err as u32))
    }
}

fn sdk_acquire() -> Result<()> {
    let mut count = SDK_REF_COUNT.lock();
    if *count == 0 {
        // SAFETY: guarded by SDK_REF_COUNT, so initialization never races uninitialization.
        let err = unsafe { PvInitialize() };
        check(err).map_err(|status| anyhow!("PvInitialize failed: {status}"))?;
        info!("PvAPI initialized");
    }
    *count += 1;
    Ok(())
}

fn sdk_release() {
    let mut count = SDK_REF_COUNT.lock();
    *count = count.saturating_sub(1);
    if *count == 0 {
        // SAFETY: the last camera handle has been closed.
        unsafe { PvUnInitialize() };
        info!("PvAPI uninitialized");
    }
}

fn attr_name(name: &str) -> DeviceResult<CString> {
    CString::new(name).map_err(|_| FrameStatus::BadParameter)
}

/// One submission owned by the SDK between queue and callback.
struct InFlight {
    raw: tPvFrame,
    buffer: FrameBuffer,
    completion: CompletionHandle,
}

/// Frame-done callback invoked by PvAPI on its notification thread.
unsafe extern "C" fn frame_done(frame: *mut tPvFrame) {
    if frame.is_null() {
        return;
    }
    // SAFETY: the SDK passes back the `raw` frame of an `InFlight` still boxed
    // by `queue`, so a non-null pointer is valid to read.
    let inflight = (*frame).Context[0] as *mut InFlight;
    if inflight.is_null() {
        return;
    }
    // SAFETY: Context[0] was set from Box::into_raw in `queue` and the SDK calls
    // back exactly once per accepted frame, after which it no longer touches it.
    let InFlight {
        raw,
        mut buffer,
        completion,
    } = *Box::from_raw(inflight);

    let status = FrameStatus::from_code(raw.Status as u32);
    if status.is_success() || status.is_incomplete() {
        let format = PixelFormat::from_code(raw.Format as u32).unwrap_or(PixelFormat::Mono8);
        let metadata = FrameMetadata {
            width: raw.Width as u32,
            height: raw.Height as u32,
            region_x: raw.RegionX as u32,
            region_y: raw.RegionY as u32,
            format,
            bit_depth: raw.BitDepth as u8,
            sequence: raw.FrameCount as u64,
            timestamp: FrameMetadata::timestamp_from_parts(
                raw.TimestampHi as u32,
                raw.TimestampLo as u32,
            ),
        };
        buffer.set_completed(status, raw.ImageSize as usize, metadata);
    } else {
        buffer.set_status(status);
    }
    completion.complete(buffer);
}

/// A GigE camera opened with master access.
pub struct PvApiCamera {
    handle: tPvHandle,
    unique_id: u32,
}

// SAFETY: PvAPI handles may be used from any thread; the SDK serializes calls per camera.
unsafe impl Send for PvApiCamera {}
// SAFETY: see above; no interior state besides the opaque handle.
unsafe impl Sync for PvApiCamera {}

impl PvApiCamera {
    /// Open the camera with `unique_id` and put it in continuous acquisition mode.
    pub fn open(unique_id: u32) -> Result<Self> {
        sdk_acquire()?;

        let mut handle: tPvHandle = std::ptr::null_mut();
        // SAFETY: handle is a valid out pointer; the SDK is initialized.
        let err = unsafe { PvCameraOpen(unique_id as _, ePvAccessMaster as _, &mut handle) };
        if let Err(status) = check(err) {
            sdk_release();
            return Err(anyhow!("failed to open camera {unique_id}: {status}"));
        }

        let camera = Self { handle, unique_id };
        camera
            .set_enum("AcquisitionMode", "Continuous")
            .map_err(|status| anyhow!("failed to select continuous acquisition: {status}"))?;
        info!(unique_id, "Opened PvAPI camera");
        Ok(camera)
    }

    /// Unique id the camera was opened with.
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Read an unsigned integer attribute.
    pub fn attr_u32(&self, name: &str) -> DeviceResult<u32> {
        let name = attr_name(name)?;
        let mut value: tPvUint32 = 0;
        // SAFETY: name is NUL-terminated and value is a valid out pointer.
        check(unsafe { PvAttrUint32Get(self.handle, name.as_ptr(), &mut value) })?;
        Ok(value as u32)
    }

    /// Read an enumeration attribute as its symbolic value.
    pub fn attr_enum(&self, name: &str) -> DeviceResult<String> {
        let name = attr_name(name)?;
        let mut buffer = [0 as c_char; ENUM_VALUE_LEN];
        // SAFETY: buffer is writable for ENUM_VALUE_LEN bytes and the SDK NUL-terminates.
        check(unsafe {
            PvAttrEnumGet(
                self.handle,
                name.as_ptr(),
                buffer.as_mut_ptr(),
                ENUM_VALUE_LEN as _,
                std::ptr::null_mut(),
            )
        })?;
        // SAFETY: the SDK wrote a NUL-terminated string into buffer.
        let value = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Ok(value.to_string_lossy().into_owned())
    }

    fn set_enum(&self, name: &str, value: &str) -> DeviceResult<()> {
        let name = attr_name(name)?;
        let value = attr_name(value)?;
        // SAFETY: both strings are NUL-terminated and outlive the call.
        check(unsafe { PvAttrEnumSet(self.handle, name.as_ptr(), value.as_ptr()) })
    }

    fn command(&self, name: &str) -> DeviceResult<()> {
        let name = attr_name(name)?;
        // SAFETY: name is NUL-terminated; the handle is open.
        check(unsafe { PvCommandRun(self.handle, name.as_ptr()) })
    }
}

impl CaptureDevice for PvApiCamera {
    fn queue(&self, buffer: FrameBuffer, completion: CompletionHandle) -> Result<(), Rejection> {
        let mut inflight = Box::new(InFlight {
            raw: tPvFrame::default(),
            buffer,
            completion,
        });
        inflight.raw.ImageBuffer = inflight.buffer.payload_ptr() as *mut c_void;
        inflight.raw.ImageBufferSize = inflight.buffer.capacity() as _;

        let ptr = Box::into_raw(inflight);
        // SAFETY: ptr comes from Box::into_raw and stays valid until reclaimed
        // either below or in frame_done; raw is pinned inside the box.
        let err = unsafe {
            (*ptr).raw.Context[0] = ptr as *mut c_void;
            PvCaptureQueueFrame(self.handle, &mut (*ptr).raw, Some(frame_done))
        };
        if let Err(status) = check(err) {
            // SAFETY: the SDK refused the frame and holds no reference to it.
            let inflight = unsafe { Box::from_raw(ptr) };
            return Err(Rejection::new(inflight.buffer, status));
        }
        Ok(())
    }

    fn cancel_all(&self) -> DeviceResult<()> {
        debug!(unique_id = self.unique_id, "clearing PvAPI capture queue");
        // SAFETY: handle is open; queued frames are returned through frame_done as cancelled.
        check(unsafe { PvCaptureQueueClear(self.handle) })
    }

    fn bytes_per_frame(&self) -> DeviceResult<usize> {
        self.attr_u32("TotalBytesPerFrame").map(|bytes| bytes as usize)
    }

    fn current_width(&self) -> DeviceResult<u32> {
        self.attr_u32("Width")
    }

    fn current_height(&self) -> DeviceResult<u32> {
        self.attr_u32("Height")
    }

    fn current_pixel_format(&self) -> DeviceResult<PixelFormat> {
        self.attr_enum("PixelFormat")?
            .parse()
            .map_err(|_| FrameStatus::WrongType)
    }

    fn start_acquisition(&self) -> DeviceResult<()> {
        // SAFETY: handle is open.
        check(unsafe { PvCaptureStart(self.handle) })?;
        if let Err(status) = self.command("AcquisitionStart") {
            // SAFETY: capture was started above.
            unsafe { PvCaptureEnd(self.handle) };
            return Err(status);
        }
        Ok(())
    }

    fn stop_acquisition(&self) -> DeviceResult<()> {
        let stopped = self.command("AcquisitionStop");
        // SAFETY: handle is open; clearing before ending capture returns every frame.
        let cleared = check(unsafe { PvCaptureQueueClear(self.handle) });
        // SAFETY: handle is open.
        let ended = check(unsafe { PvCaptureEnd(self.handle) });
        stopped.and(cleared).and(ended)
    }
}

impl Drop for PvApiCamera {
    fn drop(&mut self) {
        // SAFETY: the handle was opened in `open` and is closed exactly once here.
        if let Err(status) = check(unsafe { PvCameraClose(self.handle) }) {
            warn!(unique_id = self.unique_id, %status, "PvCameraClose failed");
        }
        sdk_release();
    }
}
