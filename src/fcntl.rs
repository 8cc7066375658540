use bitflags::bitflags;

bitflags! {
    pub struct FcntlFlags: i32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

impl FcntlFlags {
    pub fn readable(self) -> bool {
        !self.intersects(FcntlFlags::O_WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR)
    }
}
