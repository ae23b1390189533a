//! Discovery packets: presence beacons and browse probes

use bytes::BufMut;
use snapshare_core::ShareResult;

use crate::codec::{put_short_str, Reader};

/// Beacon flag: the advertiser is withdrawing
pub const BEACON_WITHDRAW: u8 = 0x01;

/// Presence announcement under a service tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Beacon {
    pub service_tag: String,
    pub display_name: String,
    pub flags: u8,
}

impl Beacon {
    pub fn announce(service_tag: &str, display_name: &str) -> Self {
        Beacon {
            service_tag: service_tag.to_owned(),
            display_name: display_name.to_owned(),
            flags: 0,
        }
    }

    pub fn withdraw(service_tag: &str, display_name: &str) -> Self {
        Beacon {
            flags: BEACON_WITHDRAW,
            ..Self::announce(service_tag, display_name)
        }
    }

    #[inline]
    pub fn is_withdraw(&self) -> bool {
        self.flags & BEACON_WITHDRAW != 0
    }

    pub fn write<B: BufMut>(&self, out: &mut B) -> ShareResult<()> {
        put_short_str(out, &self.service_tag)?;
        put_short_str(out, &self.display_name)?;
        out.put_u8(self.flags);
        Ok(())
    }

    pub fn read(r: &mut Reader<'_>) -> ShareResult<Self> {
        let beacon = Beacon {
            service_tag: r.short_str()?,
            display_name: r.short_str()?,
            flags: r.u8()?,
        };
        r.finish()?;
        Ok(beacon)
    }
}

/// Browser's request for advertisers of a tag to announce themselves now
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub service_tag: String,
}

impl Probe {
    pub fn new(service_tag: &str) -> Self {
        Probe {
            service_tag: service_tag.to_owned(),
        }
    }

    pub fn write<B: BufMut>(&self, out: &mut B) -> ShareResult<()> {
        put_short_str(out, &self.service_tag)
    }

    pub fn read(r: &mut Reader<'_>) -> ShareResult<Self> {
        let probe = Probe {
            service_tag: r.short_str()?,
        };
        r.finish()?;
        Ok(probe)
    }
}
