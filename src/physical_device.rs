use std::{
    cmp::Reverse,
    collections::HashSet,
    ffi::{CStr, CString},
};

use anyhow::Result;
use ash::vk::{self, PhysicalDeviceFeatures, PhysicalDeviceType, QueueFlags, KHR_SWAPCHAIN_NAME};
use tracing::debug;

use crate::{Instance, Surface};

/// Score given to discrete GPUs, which are preferred over everything else.
const DISCRETE_GPU_SCORE: u32 = 2000;
/// Score given to every other device class (integrated, virtual, CPU, ...).
const OTHER_GPU_SCORE: u32 = 1000;

/// The instance reported zero physical devices. Retrying cannot succeed
/// without changing the environment, e.g. installing a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no physical devices with Vulkan support were found")]
pub struct NoDeviceFound;

/// One queue family of a physical device, as reported by the driver.
#[derive(Debug, Clone)]
pub struct QueueFamily {
    /// The operations the family supports (graphics, compute, transfer, ...)
    pub flags: QueueFlags,
    /// How many queues can be created from this family
    pub queue_count: u32,
    /// Whether the family can present images to the surface the candidate
    /// was enumerated against
    pub supports_present: bool,
}

/// A physical GPU visible to the instance, along with everything queried
/// about it during enumeration. The handle is owned by the instance; dropping
/// a candidate frees nothing.
#[derive(Debug, Clone)]
pub struct CandidateDevice {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: PhysicalDeviceType,
    pub features: PhysicalDeviceFeatures,
    /// Names of the device extensions the candidate supports
    pub extensions: HashSet<CString>,
    /// Queue families in the order the driver reports them
    pub queue_families: Vec<QueueFamily>,
    /// First queue family capable of graphics work, if any
    pub graphics_family: Option<u32>,
    /// First queue family capable of presenting to the surface, if any
    pub present_family: Option<u32>,
    pub score: u32,
}

impl CandidateDevice {
    /// Builds a candidate from the queried capability data, deriving the
    /// queue family indices and the suitability score.
    pub fn new(
        handle: vk::PhysicalDevice,
        name: String,
        device_type: PhysicalDeviceType,
        features: PhysicalDeviceFeatures,
        extensions: HashSet<CString>,
        queue_families: Vec<QueueFamily>,
    ) -> Self {
        let (graphics_family, present_family) = find_queue_family_indices(&queue_families);
        let mut candidate = Self {
            handle,
            name,
            device_type,
            features,
            extensions,
            queue_families,
            graphics_family,
            present_family,
            score: 0,
        };
        candidate.score = candidate.compute_score();
        candidate
    }

    /// True if the candidate supports the named device extension.
    pub fn supports_extension(&self, extension_name: &CStr) -> bool {
        self.extensions.contains(extension_name)
    }

    /// True if both a graphics capable and a presentation capable queue
    /// family were found. The score does not take this into account, so
    /// callers must check it before actually using a candidate.
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Ranks the candidate: discrete GPUs beat everything else, and a device
    /// without swapchain support is unusable for presentation and scores 0
    /// no matter its class.
    fn compute_score(&self) -> u32 {
        let base_score = match self.device_type {
            PhysicalDeviceType::DISCRETE_GPU => DISCRETE_GPU_SCORE,
            _ => OTHER_GPU_SCORE,
        };

        if self.supports_extension(KHR_SWAPCHAIN_NAME) {
            base_score
        } else {
            0
        }
    }
}

/// Scans the queue families in index order and records the first graphics
/// capable family and, independently, the first presentation capable family.
/// The scan stops once both are found.
fn find_queue_family_indices(queue_families: &[QueueFamily]) -> (Option<u32>, Option<u32>) {
    let mut graphics_family = None;
    let mut present_family = None;

    for (index, queue_family) in queue_families.iter().enumerate() {
        if graphics_family.is_none() && queue_family.flags.contains(QueueFlags::GRAPHICS) {
            graphics_family = Some(index as u32);
        }
        if present_family.is_none() && queue_family.supports_present {
            present_family = Some(index as u32);
        }
        if graphics_family.is_some() && present_family.is_some() {
            break;
        }
    }

    (graphics_family, present_family)
}

/// Sorts candidates best first. Equal scores keep their enumeration order.
/// Fails with [`NoDeviceFound`] when there is nothing to rank.
fn rank_candidates(
    mut candidates: Vec<CandidateDevice>,
) -> Result<Vec<CandidateDevice>, NoDeviceFound> {
    if candidates.is_empty() {
        return Err(NoDeviceFound);
    }
    candidates.sort_by_key(|candidate| Reverse(candidate.score));
    Ok(candidates)
}

/// Wraps the Vulkan queries used to pick a rendering capable GPU for a
/// given instance and surface.
pub struct DeviceSelector<'a> {
    instance: &'a Instance,
    surface: &'a Surface,
}

impl<'a> DeviceSelector<'a> {
    pub fn new(instance: &'a Instance, surface: &'a Surface) -> Self {
        Self { instance, surface }
    }

    /// Queries every physical device visible to the instance and returns
    /// them in order of preference, best first. Only reads from the driver;
    /// the instance and surface are left untouched.
    pub fn enumerate(&self) -> Result<Vec<CandidateDevice>> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices() }?;
        debug!("Driver reported {} physical device(s)", physical_devices.len());

        let candidates = physical_devices
            .into_iter()
            .map(|physical_device| self.query_candidate(physical_device))
            .collect::<Vec<_>>();

        let candidates = rank_candidates(candidates)?;
        Ok(candidates)
    }

    /// Gathers the capability data for one device. A failing capability
    /// query counts as "no capabilities of that kind" rather than an error,
    /// so one misbehaving device cannot abort the whole enumeration.
    fn query_candidate(&self, physical_device: vk::PhysicalDevice) -> CandidateDevice {
        let properties = unsafe { self.instance.get_physical_device_properties(physical_device) };
        let features = unsafe { self.instance.get_physical_device_features(physical_device) };
        let name = properties
            .device_name_as_c_str()
            .map(|device_name| device_name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let extensions =
            unsafe { self.instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default()
                .iter()
                .filter_map(|extension| extension.extension_name_as_c_str().ok())
                .map(|extension_name| extension_name.to_owned())
                .collect::<HashSet<_>>();

        let queue_families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        }
        .into_iter()
        .enumerate()
        .map(|(index, queue_family_props)| QueueFamily {
            flags: queue_family_props.queue_flags,
            queue_count: queue_family_props.queue_count,
            supports_present: self
                .surface
                .get_physical_device_surface_support(&physical_device, index as u32)
                .unwrap_or_default(),
        })
        .collect::<Vec<_>>();

        CandidateDevice::new(
            physical_device,
            name,
            properties.device_type,
            features,
            extensions,
            queue_families,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_family(flags: QueueFlags, supports_present: bool) -> QueueFamily {
        QueueFamily {
            flags,
            queue_count: 1,
            supports_present,
        }
    }

    fn candidate(
        name: &str,
        device_type: PhysicalDeviceType,
        extensions: &[&CStr],
        queue_families: Vec<QueueFamily>,
    ) -> CandidateDevice {
        CandidateDevice::new(
            vk::PhysicalDevice::null(),
            name.to_owned(),
            device_type,
            PhysicalDeviceFeatures::default(),
            extensions
                .iter()
                .map(|extension_name| (*extension_name).to_owned())
                .collect(),
            queue_families,
        )
    }

    fn usable_queue_families() -> Vec<QueueFamily> {
        vec![queue_family(QueueFlags::GRAPHICS, true)]
    }

    #[test]
    fn score_is_zero_without_swapchain_extension() {
        let discrete = candidate(
            "discrete",
            PhysicalDeviceType::DISCRETE_GPU,
            &[],
            usable_queue_families(),
        );
        let integrated = candidate(
            "integrated",
            PhysicalDeviceType::INTEGRATED_GPU,
            &[],
            usable_queue_families(),
        );

        assert_eq!(discrete.score, 0);
        assert_eq!(integrated.score, 0);
    }

    #[test]
    fn discrete_gpus_outscore_every_other_class() {
        let discrete = candidate(
            "discrete",
            PhysicalDeviceType::DISCRETE_GPU,
            &[KHR_SWAPCHAIN_NAME],
            usable_queue_families(),
        );
        let integrated = candidate(
            "integrated",
            PhysicalDeviceType::INTEGRATED_GPU,
            &[KHR_SWAPCHAIN_NAME],
            usable_queue_families(),
        );
        let cpu = candidate(
            "cpu",
            PhysicalDeviceType::CPU,
            &[KHR_SWAPCHAIN_NAME],
            usable_queue_families(),
        );

        assert_eq!(discrete.score, 2000);
        assert_eq!(integrated.score, 1000);
        assert_eq!(cpu.score, 1000);
        assert!(discrete.score > integrated.score);
    }

    #[test]
    fn unrelated_extensions_do_not_lift_the_gate() {
        let decoy_extension = CString::new("VK_KHR_maintenance1").unwrap();
        let discrete = candidate(
            "discrete",
            PhysicalDeviceType::DISCRETE_GPU,
            &[decoy_extension.as_c_str()],
            usable_queue_families(),
        );

        assert!(!discrete.supports_extension(KHR_SWAPCHAIN_NAME));
        assert_eq!(discrete.score, 0);
    }

    #[test]
    fn first_graphics_family_wins() {
        let families = vec![
            queue_family(QueueFlags::TRANSFER, false),
            queue_family(QueueFlags::GRAPHICS, false),
            queue_family(QueueFlags::GRAPHICS | QueueFlags::COMPUTE, false),
        ];
        let device = candidate(
            "gpu",
            PhysicalDeviceType::DISCRETE_GPU,
            &[KHR_SWAPCHAIN_NAME],
            families,
        );

        assert_eq!(device.graphics_family, Some(1));
        assert_eq!(device.present_family, None);
        assert!(!device.is_complete());
    }

    #[test]
    fn present_family_is_found_independently_of_graphics() {
        let families = vec![
            queue_family(QueueFlags::GRAPHICS, false),
            queue_family(QueueFlags::TRANSFER, false),
            queue_family(QueueFlags::TRANSFER, true),
        ];
        let device = candidate(
            "gpu",
            PhysicalDeviceType::DISCRETE_GPU,
            &[KHR_SWAPCHAIN_NAME],
            families,
        );

        assert_eq!(device.graphics_family, Some(0));
        assert_eq!(device.present_family, Some(2));
        assert!(device.is_complete());
    }

    #[test]
    fn same_family_may_serve_graphics_and_presentation() {
        let device = candidate(
            "gpu",
            PhysicalDeviceType::INTEGRATED_GPU,
            &[KHR_SWAPCHAIN_NAME],
            usable_queue_families(),
        );

        assert_eq!(device.graphics_family, Some(0));
        assert_eq!(device.present_family, Some(0));
    }

    #[test]
    fn score_ignores_missing_queue_families() {
        // a candidate with no usable queues still keeps its class score; only
        // is_complete reveals that it cannot actually render or present
        let device = candidate(
            "gpu",
            PhysicalDeviceType::DISCRETE_GPU,
            &[KHR_SWAPCHAIN_NAME],
            vec![],
        );

        assert_eq!(device.score, 2000);
        assert!(!device.is_complete());
    }

    #[test]
    fn candidates_are_ranked_best_first() {
        let ranked = rank_candidates(vec![
            candidate(
                "integrated",
                PhysicalDeviceType::INTEGRATED_GPU,
                &[KHR_SWAPCHAIN_NAME],
                usable_queue_families(),
            ),
            candidate(
                "discrete",
                PhysicalDeviceType::DISCRETE_GPU,
                &[KHR_SWAPCHAIN_NAME],
                usable_queue_families(),
            ),
        ])
        .unwrap();

        let names = ranked
            .iter()
            .map(|device| device.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["discrete", "integrated"]);
    }

    #[test]
    fn equal_scores_keep_enumeration_order() {
        let ranked = rank_candidates(vec![
            candidate(
                "first",
                PhysicalDeviceType::INTEGRATED_GPU,
                &[KHR_SWAPCHAIN_NAME],
                usable_queue_families(),
            ),
            candidate(
                "discrete",
                PhysicalDeviceType::DISCRETE_GPU,
                &[KHR_SWAPCHAIN_NAME],
                usable_queue_families(),
            ),
            candidate(
                "second",
                PhysicalDeviceType::VIRTUAL_GPU,
                &[KHR_SWAPCHAIN_NAME],
                usable_queue_families(),
            ),
        ])
        .unwrap();

        let names = ranked
            .iter()
            .map(|device| device.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["discrete", "first", "second"]);
    }

    #[test]
    fn integrated_with_swapchain_beats_discrete_without() {
        let ranked = rank_candidates(vec![
            candidate(
                "integrated",
                PhysicalDeviceType::INTEGRATED_GPU,
                &[KHR_SWAPCHAIN_NAME],
                usable_queue_families(),
            ),
            candidate(
                "discrete",
                PhysicalDeviceType::DISCRETE_GPU,
                &[],
                usable_queue_families(),
            ),
        ])
        .unwrap();

        assert_eq!(ranked[0].name, "integrated");
        assert_eq!(ranked[0].score, 1000);
        assert_eq!(ranked[1].name, "discrete");
        assert_eq!(ranked[1].score, 0);
    }

    #[test]
    fn ranking_nothing_reports_no_device_found() {
        let error = rank_candidates(vec![]).unwrap_err();
        assert_eq!(error, NoDeviceFound);
    }
}
