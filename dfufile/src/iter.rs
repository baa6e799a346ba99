use crate::*;

/// Decodes the targets of a DfuSe image one at a time.
pub struct DfuseTargetIterator<'a> {
    data: &'a [u8],
    offset: usize,
    index: usize,
    targets: usize,
}

/// Merges directly adjacent elements into contiguous ranges.
pub struct ElementRangeIterator<'a> {
    elements: std::slice::Iter<'a, DfuseElement>,
    pending: Option<DfuseElement>,
}

impl<'a> DfuseTargetIterator<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, DfuFileError> {
        if !is_dfuse_payload(data) {
            return Err(DfuFileError::InvalidPrefix(
                "signature mismatch".into(),
            ));
        }
        if data.len() < DFUSE_PREFIX_LEN {
            return Err(DfuFileError::TooShort(data.len()));
        }
        if data[5] != DFUSE_VERSION {
            return Err(DfuFileError::InvalidPrefix(format!(
                "unsupported version {}",
                data[5]
            )));
        }
        let image_size = extract_u32(data, 6) as usize;
        if image_size < DFUSE_PREFIX_LEN || image_size > data.len() {
            return Err(DfuFileError::InvalidPrefix(format!(
                "image size {image_size} does not fit {} bytes",
                data.len()
            )));
        }
        Ok(DfuseTargetIterator {
            data: &data[..image_size],
            offset: DFUSE_PREFIX_LEN,
            index: 0,
            targets: usize::from(data[10]),
        })
    }

    pub fn target_count(&self) -> usize {
        self.targets
    }

    fn decode_target(&mut self) -> Result<DfuseTarget, DfuFileError> {
        let index = self.index;
        let invalid = |reason: &str| DfuFileError::InvalidTarget {
            index,
            reason: reason.into(),
        };

        let prefix = self
            .data
            .get(self.offset..self.offset + DFUSE_TARGET_PREFIX_LEN)
            .ok_or(DfuFileError::Truncated(self.offset))?;
        if !prefix.starts_with(DFUSE_TARGET_SIGNATURE) {
            return Err(invalid("signature mismatch"));
        }
        let alt_setting = prefix[6];
        let named = extract_u32(prefix, 7) != 0;
        let name = named.then(|| {
            let raw = &prefix[11..11 + DFUSE_TARGET_NAME_LEN];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        });
        let target_size = extract_u32(prefix, 266) as usize;
        let element_count = extract_u32(prefix, 270) as usize;
        self.offset += DFUSE_TARGET_PREFIX_LEN;

        let end = self
            .offset
            .checked_add(target_size)
            .filter(|end| *end <= self.data.len())
            .ok_or(DfuFileError::Truncated(self.offset))?;
        let mut elements = Vec::new();
        let mut offset = self.offset;
        for _ in 0..element_count {
            let header = self
                .data
                .get(offset..offset + DFUSE_ELEMENT_HEADER_LEN)
                .filter(|_| offset + DFUSE_ELEMENT_HEADER_LEN <= end)
                .ok_or(DfuFileError::Truncated(offset))?;
            let address = extract_u32(header, 0);
            let size = extract_u32(header, 4) as usize;
            offset += DFUSE_ELEMENT_HEADER_LEN;
            let data = offset
                .checked_add(size)
                .filter(|e| *e <= end)
                .map(|e| &self.data[offset..e])
                .ok_or(DfuFileError::Truncated(offset))?;
            elements.push(DfuseElement {
                address,
                data: data.to_vec(),
            });
            offset += size;
        }
        if offset != end {
            return Err(invalid(
                "element sizes do not add up to the target size",
            ));
        }
        self.offset = end;

        Ok(DfuseTarget {
            alt_setting,
            name,
            elements,
        })
    }
}

impl Iterator for DfuseTargetIterator<'_> {
    type Item = Result<DfuseTarget, DfuFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.targets {
            return None;
        }
        let target = self.decode_target();
        self.index += 1;
        if target.is_err() {
            // no way to find the next target after a broken one
            self.targets = self.index;
        }
        Some(target)
    }
}

impl<'a> ElementRangeIterator<'a> {
    pub fn new(elements: &'a [DfuseElement]) -> Self {
        ElementRangeIterator {
            elements: elements.iter(),
            pending: None,
        }
    }
}

impl Iterator for ElementRangeIterator<'_> {
    type Item = DfuseElement;

    fn next(&mut self) -> Option<Self::Item> {
        for element in self.elements.by_ref() {
            let Some(range) = self.pending.as_mut() else {
                self.pending = Some(element.clone());
                continue;
            };
            let end = u64::from(range.address) + range.data.len() as u64;
            if end == u64::from(element.address) {
                range.data.extend_from_slice(&element.data);
            } else {
                return self.pending.replace(element.clone());
            }
        }
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::dfuse_image;

    #[test]
    fn test_target_iterator() {
        let image = dfuse_image(&[
            (0, Some("Flash"), &[(0x08000000, &[1, 2])]),
            (1, None, &[]),
        ]);
        let mut iter = DfuseTargetIterator::new(&image).unwrap();
        assert_eq!(iter.target_count(), 2);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.name.as_deref(), Some("Flash"));
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.alt_setting, 1);
        assert!(second.elements.is_empty());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_stops_after_error() {
        let mut image = dfuse_image(&[
            (0, None, &[(0x08000000, &[1, 2])]),
            (1, None, &[(0x08000000, &[1, 2])]),
        ]);
        image[DFUSE_PREFIX_LEN] = b'X';
        let results: Vec<_> =
            DfuseTargetIterator::new(&image).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(DfuFileError::InvalidTarget { index: 0, .. })
        ));
    }

    #[test]
    fn test_merge_adjacent_elements() {
        let elements = vec![
            DfuseElement { address: 0x1000, data: vec![1; 16] },
            DfuseElement { address: 0x1010, data: vec![2; 16] },
            DfuseElement { address: 0x2000, data: vec![3; 4] },
            DfuseElement { address: 0x2004, data: vec![4; 4] },
        ];
        let ranges: Vec<_> = ElementRangeIterator::new(&elements).collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].address, 0x1000);
        assert_eq!(ranges[0].data.len(), 32);
        assert_eq!(ranges[0].data[16], 2);
        assert_eq!(ranges[1].address, 0x2000);
        assert_eq!(ranges[1].data, vec![3, 3, 3, 3, 4, 4, 4, 4]);
        assert_eq!(ElementRangeIterator::new(&[]).count(), 0);
    }
}
