//! Hard caps on input sizes. Column widths follow the classroom schema.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_LESSONS_PER_ROOM: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 1_000;

pub const MAX_ROOM_NUMBER_LEN: usize = 10;
pub const MAX_BUILDING_LEN: usize = 10;
pub const MAX_GROUP_NAME_LEN: usize = 50;
pub const MAX_TEACHER_NAME_LEN: usize = 100;
pub const MAX_SUBJECT_NAME_LEN: usize = 100;

pub const MAX_SQL_LEN: usize = 1 << 20;
