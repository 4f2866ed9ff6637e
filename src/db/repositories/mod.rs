mod cases;
mod facilities;
mod readers;
mod results;
mod sessions;
