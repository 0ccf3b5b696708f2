pub mod classes;
pub mod core;
pub mod schools;
pub mod subjects;
pub mod timetable;
