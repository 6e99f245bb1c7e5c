use crate::compiler::{Link, Rights, Section, SectionId};
use std::collections::BTreeMap;
use thiserror::Error;

/// Alignment of every section within its rights class.
const SECTION_ALIGN: usize = 16;

#[derive(Debug, Error)]
pub enum LoadErr {
    #[error("Host memory operation failed: {0}")]
    Region(#[from] region::Error),
    #[error("Link {0:?} does not fit its sections")]
    BadLink(Link),
    #[error("Entry point {0:?} is not in an executable section")]
    BadEntry((SectionId, usize)),
    #[error("Generated code only runs on x86-64 unix hosts")]
    UnsupportedHost,
}

/// What the loader did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStep {
    Allocate { rights: Rights, size: usize },
    Copy { section: SectionId },
    Link { link: Link, address: u64 },
    Protect { rights: Rights },
}

/// Sections placed in host memory with their final page protection.
pub struct Image {
    regions: BTreeMap<Rights, region::Allocation>,
    /// Rights class and offset of every section.
    placements: Vec<(Rights, usize)>,
    journal: Vec<LoadStep>,
}

fn protection(rights: Rights) -> region::Protection {
    match rights {
        Rights::ReadOnly => region::Protection::READ,
        Rights::ReadWrite => region::Protection::READ_WRITE,
        Rights::Executable => region::Protection::READ_EXECUTE,
    }
}

/// Assign every section an aligned offset within its rights class, returning the total size of
/// each class.
fn place(sections: &mut [Section]) -> BTreeMap<Rights, usize> {
    let mut sizes: BTreeMap<Rights, usize> = BTreeMap::new();
    for section in sections.iter_mut() {
        let size = sizes.entry(section.rights).or_insert(0);
        let offset = (*size + SECTION_ALIGN - 1) / SECTION_ALIGN * SECTION_ALIGN;
        section.offset = Some(offset);
        *size = offset + section.data.len();
    }
    sizes.retain(|_, size| *size > 0);
    sizes
}

/// Place `sections` in fresh pages, resolve `links`, then protect the pages. Sections get their
/// offsets filled in. Pages are released when the [Image] is dropped, including on error.
pub fn load(sections: &mut [Section], links: &[Link]) -> Result<Image, LoadErr> {
    let sizes = place(sections);
    let mut image = Image {
        regions: BTreeMap::new(),
        placements: sections
            .iter()
            .map(|s| (s.rights, s.offset.unwrap_or(0)))
            .collect(),
        journal: vec![],
    };

    for (&rights, &size) in &sizes {
        let allocation = region::alloc(size, region::Protection::READ_WRITE)?;
        log::debug!(
            "allocated {} bytes for {:?} at {:p}",
            allocation.len(),
            rights,
            allocation.as_ptr::<u8>()
        );
        image.regions.insert(rights, allocation);
        image.journal.push(LoadStep::Allocate { rights, size });
    }

    for (id, section) in sections.iter().enumerate() {
        if section.data.is_empty() {
            continue;
        }
        let dst = image.host_address(id, 0).ok_or(LoadErr::BadEntry((id, 0)))?;
        // Safety: place() sized the allocation to cover every section of this class
        unsafe {
            std::ptr::copy_nonoverlapping(
                section.data.as_ptr(),
                dst as *mut u8,
                section.data.len(),
            );
        }
        image.journal.push(LoadStep::Copy { section: id });
    }

    for link in links {
        let fits = |id: SectionId, offset: usize, width: usize| {
            sections.get(id).map_or(false, |s| offset + width <= s.data.len())
        };
        if !fits(link.pointer_section, link.pointer_offset, 8)
            || !fits(link.pointee_section, link.pointee_offset, 0)
        {
            return Err(LoadErr::BadLink(*link));
        }
        let (pointer, pointee) = match (
            image.host_address(link.pointer_section, link.pointer_offset),
            image.host_address(link.pointee_section, link.pointee_offset),
        ) {
            (Some(pointer), Some(pointee)) => (pointer, pointee),
            _ => return Err(LoadErr::BadLink(*link)),
        };
        // Safety: bounds were checked above and the pages are still writable
        unsafe {
            std::ptr::write_unaligned(pointer as *mut u64, pointee as u64);
        }
        image.journal.push(LoadStep::Link { link: *link, address: pointee as u64 });
    }

    for (&rights, allocation) in &image.regions {
        if rights == Rights::ReadWrite {
            continue;
        }
        // Safety: the range is exactly our own allocation
        unsafe {
            region::protect(allocation.as_ptr::<u8>(), allocation.len(), protection(rights))?;
        }
        log::debug!("protected {:?} pages", rights);
        image.journal.push(LoadStep::Protect { rights });
    }

    Ok(image)
}

impl Image {
    /// Start of the pages holding a rights class.
    pub fn base(&self, rights: Rights) -> Option<usize> {
        self.regions.get(&rights).map(|a| a.as_ptr::<u8>() as usize)
    }

    /// Absolute address of an offset within a placed section.
    pub fn host_address(&self, section: SectionId, offset: usize) -> Option<usize> {
        let &(rights, placed) = self.placements.get(section)?;
        Some(self.base(rights)? + placed + offset)
    }

    pub fn journal(&self) -> &[LoadStep] {
        &self.journal
    }

    /// Read back 8 bytes of a placed section.
    pub fn read_u64(&self, section: SectionId, offset: usize) -> Option<u64> {
        let &(rights, placed) = self.placements.get(section)?;
        let allocation = self.regions.get(&rights)?;
        if placed + offset + 8 > allocation.len() {
            return None;
        }
        let address = self.host_address(section, offset)?;
        // Safety: in bounds, and every class stays readable
        Some(unsafe { std::ptr::read_unaligned(address as *const u64) })
    }

    /// Call the code at `entry` as `extern "C" fn() -> f64`.
    ///
    /// # Safety
    /// The entry must be machine code produced by [crate::compiler::generate], and the
    /// [crate::runtime::Runtime] it was generated against must still be alive.
    pub unsafe fn execute(&self, entry: (SectionId, usize)) -> Result<f64, LoadErr> {
        match self.placements.get(entry.0) {
            Some((Rights::Executable, _)) => {}
            _ => return Err(LoadErr::BadEntry(entry)),
        }
        let address = self.host_address(entry.0, entry.1).ok_or(LoadErr::BadEntry(entry))?;
        call(address)
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
unsafe fn call(address: usize) -> Result<f64, LoadErr> {
    let f: extern "C" fn() -> f64 = std::mem::transmute(address);
    log::debug!("calling entry at {:#x}", address);
    Ok(f())
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
unsafe fn call(_address: usize) -> Result<f64, LoadErr> {
    Err(LoadErr::UnsupportedHost)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sections() -> Vec<Section> {
        vec![
            Section::new(Rights::Executable, vec![0x90; 20]),
            Section::new(Rights::ReadOnly, 7.5f64.to_le_bytes().to_vec()),
            Section::new(Rights::Executable, vec![0xCC; 8]),
            Section::new(Rights::ReadWrite, vec![0; 16]),
        ]
    }

    fn link(pointer: (SectionId, usize), pointee: (SectionId, usize)) -> Link {
        Link {
            pointer_section: pointer.0,
            pointer_offset: pointer.1,
            pointee_section: pointee.0,
            pointee_offset: pointee.1,
        }
    }

    #[test]
    fn sections_are_placed_per_class_and_aligned() {
        let mut s = sections();
        let sizes = place(&mut s);
        assert_eq!(s[0].offset, Some(0));
        assert_eq!(s[1].offset, Some(0));
        assert_eq!(s[2].offset, Some(32));
        assert_eq!(s[3].offset, Some(0));
        assert_eq!(sizes[&Rights::Executable], 40);
    }

    #[test]
    fn links_hold_base_plus_placement_plus_offset() {
        let mut s = sections();
        let links = vec![link((0, 4), (1, 0)), link((2, 0), (0, 8)), link((3, 8), (2, 4))];
        let image = load(&mut s, &links).unwrap();

        for l in &links {
            let pointee = &s[l.pointee_section];
            let expected =
                image.base(pointee.rights).unwrap() + pointee.offset.unwrap() + l.pointee_offset;
            assert_eq!(image.read_u64(l.pointer_section, l.pointer_offset), Some(expected as u64));
        }
        // Untouched bytes survive the copy
        assert_eq!(image.read_u64(1, 0), Some(7.5f64.to_bits()));
    }

    #[test]
    fn links_are_written_before_any_protection_change() {
        let mut s = sections();
        let image = load(&mut s, &[link((0, 0), (1, 0)), link((3, 0), (0, 0))]).unwrap();
        let journal = image.journal();

        let last_link = journal.iter().rposition(|s| matches!(s, LoadStep::Link { .. })).unwrap();
        let first_protect = journal
            .iter()
            .position(|s| matches!(s, LoadStep::Protect { .. }))
            .unwrap();
        assert!(last_link < first_protect);

        let protected: Vec<Rights> = journal
            .iter()
            .filter_map(|s| match s {
                LoadStep::Protect { rights } => Some(*rights),
                _ => None,
            })
            .collect();
        assert_eq!(protected, vec![Rights::ReadOnly, Rights::Executable]);
    }

    #[test]
    fn links_outside_their_sections_are_rejected() {
        let mut s = sections();
        let bad = link((1, 4), (0, 0));
        assert!(matches!(load(&mut s, &[bad]), Err(LoadErr::BadLink(l)) if l == bad));
        let bad = link((0, 0), (9, 0));
        assert!(matches!(load(&mut s, &[bad]), Err(LoadErr::BadLink(_))));
    }

    #[test]
    fn entries_must_be_executable() {
        let mut s = sections();
        let image = load(&mut s, &[]).unwrap();
        assert!(matches!(unsafe { image.execute((1, 0)) }, Err(LoadErr::BadEntry((1, 0)))));
    }
}
