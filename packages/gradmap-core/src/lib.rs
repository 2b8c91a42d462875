/*
 * Gradmap Core - per-task gradient mapping primitives
 *
 * Everything a single unit of work needs, with no knowledge of jobs:
 * - Task descriptors (input, gradient, output, quality, format)
 * - The Transform seam the batch executor drives
 * - The gradient-map transform itself (luminance -> 256-entry lookup row)
 * - Deterministic output naming
 */

pub mod descriptor;
pub mod gradient;
pub mod naming;
pub mod transform;

pub use descriptor::{OutputFormat, Quality, QualityError, TaskDescriptor, UnknownFormat};
pub use gradient::{apply_lut, gradient_lut, GradientMapTransform, Lut, LUT_SIZE};
pub use naming::output_file_name;
pub use transform::{FnTransform, Transform, TransformError};
