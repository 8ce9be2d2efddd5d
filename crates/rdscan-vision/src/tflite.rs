use anyhow::Result;
use image::{imageops::FilterType, RgbImage};
use std::{ffi::CString, os::raw::{c_char, c_int, c_void}, ptr};
use tracing::info;

use crate::{nms_filter, postprocess_ultralytics, Detection, Detector, VisionConfig};

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;

    fn TfLiteTensorNumDims(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorDim(tensor: *const TfLiteTensor, dim_index: c_int) -> c_int;
}

/// Road-damage model through the TFLite C API. Expects a u8 RGB input of
/// `img_w` x `img_h` and one ultralytics-layout output tensor.
pub struct TfliteDetector {
    cfg: VisionConfig,
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
}

// The interpreter is only ever driven from the frame loop that owns it.
unsafe impl Send for TfliteDetector {}

impl TfliteDetector {
    pub fn new(cfg: VisionConfig) -> Result<Self> {
        anyhow::ensure!(cfg.backend == "tflite", "unsupported vision.backend: {}", cfg.backend);
        anyhow::ensure!(!cfg.class_names.is_empty(), "vision.class_names is empty");

        let cpath = CString::new(cfg.model_path.as_str())?;
        let model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        anyhow::ensure!(!model.is_null(), "failed to load tflite model: {}", cfg.model_path);

        let opts = unsafe { TfLiteInterpreterOptionsCreate() };
        if opts.is_null() {
            unsafe { TfLiteModelDelete(model) };
            anyhow::bail!("failed to create tflite options");
        }
        unsafe { TfLiteInterpreterOptionsSetNumThreads(opts, 4) };

        let interp = unsafe { TfLiteInterpreterCreate(model, opts) };
        let det = Self { cfg, model, opts, interp };
        anyhow::ensure!(!det.interp.is_null(), "failed to create tflite interpreter");

        let rc = unsafe { TfLiteInterpreterAllocateTensors(det.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterAllocateTensors failed");

        info!("vision: loaded TFLite model {} ({} classes)", det.cfg.model_path, det.cfg.class_names.len());
        Ok(det)
    }

    pub fn inspect(&mut self) -> Result<String> {
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let out0 = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        anyhow::ensure!(!out0.is_null(), "no output tensor 0");

        Ok(format!(
            "TFLite inspect:\n- input[0] dims={:?} bytes={}\n- output[0] dims={:?} bytes={}\n- classes={:?}\n",
            tensor_dims(input),
            unsafe { TfLiteTensorByteSize(input) },
            tensor_dims(out0),
            unsafe { TfLiteTensorByteSize(out0) },
            self.cfg.class_names,
        ))
    }

    fn run(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let resized = image::imageops::resize(frame, self.cfg.img_w, self.cfg.img_h, FilterType::Triangle);

        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let in_ptr = unsafe { TfLiteTensorData(input) as *mut u8 };
        anyhow::ensure!(!in_ptr.is_null(), "null input tensor data");

        let need = (self.cfg.img_w * self.cfg.img_h * 3) as usize;
        anyhow::ensure!(in_bytes >= need, "input tensor too small: {} < {}", in_bytes, need);
        unsafe { ptr::copy_nonoverlapping(resized.as_raw().as_ptr(), in_ptr, need) };

        let rc = unsafe { TfLiteInterpreterInvoke(self.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterInvoke failed");

        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        anyhow::ensure!(!out.is_null(), "no output tensor 0");

        let out_dims = tensor_dims(out);
        let (num_preds, stride) = match out_dims.as_slice() {
            [1, n, s] => (*n as usize, *s as usize),
            [n, s] => (*n as usize, *s as usize),
            other => anyhow::bail!("unexpected output dims {:?}; run `rdscan vision inspect`", other),
        };
        let expected = 5 + self.cfg.class_names.len();
        anyhow::ensure!(stride == expected, "stride mismatch: got {}, expected {} (dims {:?})", stride, expected, out_dims);

        let out_ptr = unsafe { TfLiteTensorData(out) as *const f32 };
        anyhow::ensure!(!out_ptr.is_null(), "null output tensor data");
        let out_len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        let raw = unsafe { std::slice::from_raw_parts(out_ptr, out_len) };

        let dets = postprocess_ultralytics(
            raw,
            num_preds,
            &self.cfg.class_names,
            self.cfg.conf_threshold,
            frame.width(),
            frame.height(),
        );
        Ok(nms_filter(dets, self.cfg.nms_iou_threshold, self.cfg.max_detections))
    }
}

impl Detector for TfliteDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        self.run(frame)
    }
}

fn tensor_dims(t: *const TfLiteTensor) -> Vec<i32> {
    unsafe {
        let nd = TfLiteTensorNumDims(t);
        (0..nd).map(|i| TfLiteTensorDim(t, i)).collect()
    }
}

impl Drop for TfliteDetector {
    fn drop(&mut self) {
        unsafe {
            if !self.interp.is_null() { TfLiteInterpreterDelete(self.interp); }
            if !self.opts.is_null() { TfLiteInterpreterOptionsDelete(self.opts); }
            if !self.model.is_null() { TfLiteModelDelete(self.model); }
        }
    }
}
