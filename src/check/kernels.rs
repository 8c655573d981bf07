// CLASSIFICATION: COMMUNITY
// Filename: kernels.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! OpenCL C sources of the canary checker kernels.
//!
//! Every checker reports, per canary region, the smallest corrupted byte
//! offset through `atomic_min` into a result array pre-filled with
//! `INT_MAX`.

/// Result slot value meaning "no corruption found".
pub const NO_CORRUPTION: u32 = i32::MAX as u32;

/// Preferred work-group size for checker dispatches.
pub const CHECKER_LOCAL_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckerKernel {
    /// Staging buffer of linear canaries, plus an SVM staging area.
    BufferCopy,
    /// Staging buffer of linear canaries only.
    BufferCopyNoSvm,
    /// One canary region read in place, mended as it is checked.
    SingleRegion,
    /// Staged buffer canaries plus a table of SVM canary addresses.
    SvmPointer,
    /// Byte-wise scan of staged image canaries.
    ImageCopy,
}

impl CheckerKernel {
    pub fn function_name(self) -> &'static str {
        match self {
            CheckerKernel::BufferCopy => "findCorruption",
            CheckerKernel::BufferCopyNoSvm => "findCorruptionNoSVM",
            CheckerKernel::SingleRegion => "locateDiffParts",
            CheckerKernel::SvmPointer => "locateDiffSVMPtr",
            CheckerKernel::ImageCopy => "findImageCorruption",
        }
    }

    /// Complete program source for this checker.
    pub fn source(self) -> String {
        let (helper, body) = match self {
            CheckerKernel::BufferCopy => (COMPARE_WORD, BUFFER_COPY_BODY),
            CheckerKernel::BufferCopyNoSvm => (COMPARE_WORD, BUFFER_COPY_NO_SVM_BODY),
            CheckerKernel::SingleRegion => (COMPARE_AND_MEND_WORD, SINGLE_REGION_BODY),
            CheckerKernel::SvmPointer => (COMPARE_AND_MEND_WORD, SVM_POINTER_BODY),
            CheckerKernel::ImageCopy => ("", IMAGE_COPY_BODY),
        };
        format!("{}{}", helper, body)
    }

    /// Build options; SVM arguments need an OpenCL 2.0 compiler.
    pub fn build_options(self) -> &'static str {
        match self {
            CheckerKernel::BufferCopy | CheckerKernel::SvmPointer => "-cl-std=CL2.0",
            _ => "",
        }
    }
}

const COMPARE_WORD: &str = r#"
uint compare_word(uint poison, uint local_word, uint index, __global uchar *B)
{
    uint ret = INT_MAX;
    if (poison != ((__global uint *)B)[index]) {
        for (uint i = 0; i < 4; i++) {
            if ((poison & 0xFF) != B[4 * index + i]) {
                ret = 4 * local_word + i;
                break;
            }
        }
    }
    return ret;
}
"#;

const COMPARE_AND_MEND_WORD: &str = r#"
uint compare_and_mend_word(uint poison, uint local_word, uint index, __global uchar *B)
{
    uint ret = INT_MAX;
    if (poison != ((__global uint *)B)[index]) {
        for (uint i = 0; i < 4; i++) {
            if ((poison & 0xFF) != B[4 * index + i]) {
                ret = 4 * local_word + i;
                break;
            }
        }
        ((__global uint *)B)[index] = poison;
    }
    return ret;
}
"#;

const BUFFER_COPY_BODY: &str = r#"
__kernel void findCorruption(uint canary_words,
                             uint buff_end,
                             uint svm_end,
                             uint poison,
                             __global uint *B,
                             __global uint *C,
                             __global uint *first)
{
    uint tid = get_global_id(0);
    if (tid >= svm_end) return;
    uint region = tid / canary_words;
    uint local_word = tid % canary_words;
    uint ret;
    if (tid < buff_end)
        ret = compare_word(poison, local_word, tid, (__global uchar *)B);
    else
        ret = compare_word(poison, local_word, tid - buff_end, (__global uchar *)C);
    if (ret != INT_MAX)
        atomic_min(&first[region], ret);
}
"#;

const BUFFER_COPY_NO_SVM_BODY: &str = r#"
__kernel void findCorruptionNoSVM(uint canary_words,
                                  uint buff_end,
                                  uint svm_end,
                                  uint poison,
                                  __global uint *B,
                                  __global uint *first)
{
    uint tid = get_global_id(0);
    if (tid >= svm_end || tid >= buff_end) return;
    uint region = tid / canary_words;
    uint ret = compare_word(poison, tid % canary_words, tid, (__global uchar *)B);
    if (ret != INT_MAX)
        atomic_min(&first[region], ret);
}
"#;

const SINGLE_REGION_BODY: &str = r#"
__kernel void locateDiffParts(uint length,
                              uint region,
                              uint poison,
                              uint offset,
                              __global uchar *B,
                              __global uint *first)
{
    uint tid = get_global_id(0);
    if (tid >= length) return;
    uint ret = compare_and_mend_word(poison, tid, tid, B + offset);
    if (ret != INT_MAX)
        atomic_min(&first[region], ret);
}
"#;

const SVM_POINTER_BODY: &str = r#"
__kernel void locateDiffSVMPtr(uint length,
                               uint end_buffs,
                               uint end_svm,
                               uint poison,
                               __global uint *B,
                               __global ulong *C,
                               __global uint *first)
{
    uint tid = get_global_id(0);
    if (tid >= end_svm) return;
    uint region = tid / length;
    uint local_word = tid % length;
    uint ret;
    if (tid < end_buffs) {
        ret = compare_and_mend_word(poison, local_word, tid, (__global uchar *)B);
    } else {
        __global uchar *svm = (__global uchar *)C[(tid - end_buffs) / length];
        ret = compare_and_mend_word(poison, local_word, local_word, svm);
    }
    if (ret != INT_MAX)
        atomic_min(&first[region], ret);
}
"#;

const IMAGE_COPY_BODY: &str = r#"
__kernel void findImageCorruption(uchar poison,
                                  uint num_images,
                                  __global uint *ends,
                                  __global uchar *B,
                                  __global uint *first)
{
    uint tid = get_global_id(0);
    uint image = 0;
    while (image < num_images && tid >= ends[image]) image++;
    if (image >= num_images) return;
    uint start = (image > 0) ? ends[image - 1] : 0;
    if (poison != B[tid])
        atomic_min(&first[image], tid - start);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CheckerKernel; 5] = [
        CheckerKernel::BufferCopy,
        CheckerKernel::BufferCopyNoSvm,
        CheckerKernel::SingleRegion,
        CheckerKernel::SvmPointer,
        CheckerKernel::ImageCopy,
    ];

    #[test]
    fn every_source_defines_its_entry_point() {
        for k in ALL {
            let needle = format!("__kernel void {}(", k.function_name());
            assert!(k.source().contains(&needle), "{:?} missing {}", k, needle);
        }
    }

    #[test]
    fn in_place_checkers_mend_canaries() {
        assert!(CheckerKernel::SingleRegion.source().contains("compare_and_mend_word"));
        assert!(CheckerKernel::SvmPointer.source().contains("compare_and_mend_word"));
        assert!(!CheckerKernel::BufferCopy.source().contains("mend"));
    }
}
